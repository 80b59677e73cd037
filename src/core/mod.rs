// Command scheduling and the transport seam devices send through

pub mod executor;
pub mod scheduler;

pub use executor::*;
pub use scheduler::*;
