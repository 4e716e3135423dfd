pub mod dom;
pub mod manager;
pub mod session;

pub use manager::{find_chrome_executable, Driver, DriverConfig};
pub use session::{Session, Workdir};
