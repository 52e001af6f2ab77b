//! CGI/1.1 execution core: turns an HTTP request into a script run and the
//! script's output back into an HTTP response.

pub mod body;
pub mod config;
pub mod coordinator;
pub mod env;
pub mod error;
pub mod process;
pub mod request;
pub mod response;
pub mod router;
pub mod server;

pub use config::Config;
pub use coordinator::CgiCoordinator;
pub use error::CgiError;
pub use request::CgiRequest;
pub use router::{Router, ScriptTarget};
