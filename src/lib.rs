pub mod cli;
pub mod credentials;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod probe;
pub mod public_ip;
pub mod report;
pub mod tls;
