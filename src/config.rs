//! TOML configuration.
//!
//! A config file describes the listen address, engine options, the frame
//! codec and the log level. Every section and field is optional.
//!
//! ```toml
//! [server]
//! listen = "tcp://0.0.0.0:9000"
//! multicore = true
//! load_balancing = "least_connections"
//!
//! [codec]
//! kind = "length_field"
//! width = 4
//!
//! [logging]
//! level = "debug"
//! ```

use crate::codec::{
    ByteOrder, Codec, DecoderConfig, DelimiterCodec, EncoderConfig, FixedLengthCodec,
    LengthFieldCodec, LineCodec, RawCodec,
};
use crate::error::CodecError;
use crate::options::{LoadBalancing, Options};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address with scheme, e.g. `tcp://127.0.0.1:9000`
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub multicore: bool,
    /// Number of event loops
    pub loops: Option<usize>,
    #[serde(default)]
    pub reuse_port: bool,
    #[serde(default)]
    pub load_balancing: LoadBalancing,
    #[serde(default)]
    pub ticker: bool,
    pub tcp_keep_alive_secs: Option<u64>,
    pub read_buffer_cap: Option<usize>,
    pub max_outbound_buffer: Option<usize>,
    pub max_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            multicore: false,
            loops: None,
            reuse_port: false,
            load_balancing: LoadBalancing::default(),
            ticker: false,
            tcp_keep_alive_secs: None,
            read_buffer_cap: None,
            max_outbound_buffer: None,
            max_connections: None,
        }
    }
}

/// Frame codec selection
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CodecConfig {
    #[default]
    Raw,
    Line,
    Delimiter {
        delimiter: char,
    },
    FixedLength {
        frame_len: usize,
    },
    LengthField {
        #[serde(default)]
        byte_order: ByteOrder,
        width: usize,
        #[serde(default)]
        length_field_offset: usize,
        /// Added to the payload length when encoding and subtracted again
        /// when decoding.
        #[serde(default)]
        length_adjustment: i64,
        #[serde(default)]
        length_includes_length_field: bool,
        /// Defaults to stripping the whole header.
        initial_bytes_to_strip: Option<usize>,
    },
}

impl CodecConfig {
    pub fn build(&self) -> Result<Arc<dyn Codec>, ConfigError> {
        Ok(match *self {
            CodecConfig::Raw => Arc::new(RawCodec),
            CodecConfig::Line => Arc::new(LineCodec::default()),
            CodecConfig::Delimiter { delimiter } => {
                if !delimiter.is_ascii() {
                    return Err(ConfigError::InvalidDelimiter(delimiter));
                }
                Arc::new(DelimiterCodec::new(delimiter as u8))
            }
            CodecConfig::FixedLength { frame_len } => Arc::new(FixedLengthCodec::new(frame_len)?),
            CodecConfig::LengthField {
                byte_order,
                width,
                length_field_offset,
                length_adjustment,
                length_includes_length_field,
                initial_bytes_to_strip,
            } => {
                let encoder = EncoderConfig {
                    byte_order,
                    length_field_length: width,
                    length_adjustment,
                    length_includes_length_field,
                };
                let decoder = DecoderConfig {
                    byte_order,
                    length_field_offset,
                    length_field_length: width,
                    length_adjustment: -length_adjustment,
                    length_includes_length_field,
                    initial_bytes_to_strip: initial_bytes_to_strip
                        .unwrap_or(length_field_offset + width),
                };
                Arc::new(LengthFieldCodec::new(encoder, decoder)?)
            }
        })
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "tcp://127.0.0.1:9000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TomlConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Engine options described by this file.
    pub fn options(&self) -> Result<Options, ConfigError> {
        let server = &self.server;
        let mut options = Options {
            multicore: server.multicore,
            num_event_loop: server.loops.unwrap_or(0),
            reuse_port: server.reuse_port,
            load_balancing: server.load_balancing,
            codec: self.codec.build()?,
            ticker: server.ticker,
            tcp_keep_alive: server.tcp_keep_alive_secs.map(Duration::from_secs),
            ..Options::default()
        };
        if let Some(cap) = server.read_buffer_cap {
            options.read_buffer_cap = cap;
        }
        if let Some(max) = server.max_outbound_buffer {
            options.max_outbound_buffer = max;
        }
        if let Some(max) = server.max_connections {
            options.max_connections = max;
        }
        Ok(options)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("delimiter {0:?} is not an ASCII character")]
    InvalidDelimiter(char),

    #[error("invalid codec: {0}")]
    Codec(#[from] CodecError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoded;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "tcp://127.0.0.1:9000");
        assert_eq!(config.codec, CodecConfig::Raw);
        assert_eq!(config.logging.level, "info");

        let options = config.options().unwrap();
        assert_eq!(options.event_loop_count(), 1);
        assert_eq!(options.max_outbound_buffer, 64 * 1024 * 1024);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "udp://0.0.0.0:5353"
            loops = 4
            reuse_port = true
            load_balancing = "source_addr_hash"
            tcp_keep_alive_secs = 30
            max_connections = 128

            [codec]
            kind = "fixed_length"
            frame_len = 16

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "udp://0.0.0.0:5353");
        assert_eq!(config.codec, CodecConfig::FixedLength { frame_len: 16 });
        assert_eq!(config.logging.level, "debug");

        let options = config.options().unwrap();
        assert_eq!(options.num_event_loop, 4);
        assert!(options.reuse_port);
        assert_eq!(options.load_balancing, LoadBalancing::SourceAddrHash);
        assert_eq!(options.tcp_keep_alive, Some(Duration::from_secs(30)));
        assert_eq!(options.max_connections, 128);
        assert_eq!(options.read_buffer_cap, 64 * 1024);
    }

    #[test]
    fn test_length_field_codec_from_toml() {
        let config: TomlConfig = toml::from_str(
            r#"
            [codec]
            kind = "length_field"
            byte_order = "little"
            width = 2
            "#,
        )
        .unwrap();
        let codec = config.codec.build().unwrap();

        let encoded = codec.encode(b"abc").unwrap();
        assert_eq!(&encoded[..], b"\x03\x00abc");
        assert_eq!(
            codec.decode(&encoded).unwrap(),
            Decoded::Frame {
                frame: bytes::Bytes::from_static(b"abc"),
                consumed: 5
            }
        );
    }

    #[test]
    fn test_invalid_codecs_rejected() {
        let delimiter = CodecConfig::Delimiter { delimiter: 'é' };
        assert!(matches!(
            delimiter.build(),
            Err(ConfigError::InvalidDelimiter('é'))
        ));

        let width = CodecConfig::LengthField {
            byte_order: ByteOrder::Big,
            width: 5,
            length_field_offset: 0,
            length_adjustment: 0,
            length_includes_length_field: false,
            initial_bytes_to_strip: None,
        };
        assert!(matches!(
            width.build(),
            Err(ConfigError::Codec(CodecError::UnsupportedWidth(5)))
        ));

        assert!(matches!(
            CodecConfig::FixedLength { frame_len: 0 }.build(),
            Err(ConfigError::Codec(CodecError::ZeroFixedLength))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = TomlConfig::from_file(Path::new("/nonexistent/loopnet.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
        assert!(err.to_string().contains("/nonexistent/loopnet.toml"));
    }

    #[test]
    fn test_unknown_codec_kind_fails_to_parse() {
        let result: Result<TomlConfig, _> = toml::from_str(
            r#"
            [codec]
            kind = "protobuf"
            "#,
        );
        assert!(result.is_err());
    }
}
