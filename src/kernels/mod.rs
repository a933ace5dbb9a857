//! Rust surface of the fused device kernels. The kernel objects themselves
//! ship with the serving binary; only their entry points are declared here.

pub mod ffi;
