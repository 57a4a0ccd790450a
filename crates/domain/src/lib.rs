pub mod change;
pub mod errors;
pub mod profile;
pub mod task;
pub mod views;

pub use change::*;
pub use errors::*;
pub use profile::*;
pub use task::*;
pub use views::*;
