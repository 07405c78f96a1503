pub mod parallel;
pub mod style_net;

pub use parallel::DeviceStrategy;
pub use style_net::{StyleNet, StyleNetConfig};
