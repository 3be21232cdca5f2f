pub mod error;
pub mod models;
pub mod observer;

pub use error::{Result, ShellError};
pub use models::*;
pub use observer::*;
