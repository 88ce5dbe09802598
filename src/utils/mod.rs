pub mod device;
pub mod format;
pub mod seed;

pub use device::select_device;
pub use format::{format_duration, format_param_count, format_with_commas};
pub use seed::set_random_seeds;
