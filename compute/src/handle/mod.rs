#[cfg(use_metal)]
pub mod apple_metal;

#[cfg(any(use_cpu, test))]
pub mod common_cpu;
