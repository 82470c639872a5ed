//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;
mod timer;

pub use error::SubastaError;
pub use print::{logger_init, me};
pub use timer::Timer;

pub(crate) use safetcp::{
    send_frame, tcp_bind_with_retry, tcp_connect_with_timeout,
};
pub(crate) use timer::now_millis;
