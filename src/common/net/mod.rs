pub use copy_with_timeout::copy_with_timeout;

pub mod copy_with_timeout;
