pub mod cli;
pub mod command;
pub mod config;
pub mod params;
pub mod protocol;

pub use cli::{Input, PromptError, prompt};
pub use command::{Command, CommandError};
pub use config::{ClientConfig, ConfigError, Framing, ServerConfig};
pub use params::ParameterStore;
pub use protocol::{Client, Codec, CodecError, Field, FieldKind, Request, Server, TransportError};
