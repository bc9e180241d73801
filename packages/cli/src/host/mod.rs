//! Local implementations of the host collaborators.
//!
//! - [`LocalHost`]: workspace folders and files on the local disk
//! - [`GithubRemote`]: runtime repositories on GitHub, cached on disk
//! - [`StdioTerminal`]: the guest terminal on this process's stdio

pub mod local;
pub mod remote;
pub mod terminal;

pub use local::{file_uri, workspace_folder, LocalHost};
pub use remote::{GithubRemote, VIRTUAL_SCHEME};
pub use terminal::{StdioTerminal, Terminal};
