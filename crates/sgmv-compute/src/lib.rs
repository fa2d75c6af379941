//! # sgmv compute
//!
//! Execution substrate for the sgmv system-matrix engine. This crate
//! provides the [`EvalKernel`](backend::EvalKernel) trait that applies the
//! implicit sparse-grid evaluation matrix over index ranges, and the
//! [`Communicator`](distributed::Communicator) trait that connects ranks.
//!
//! ## Available kernels
//!
//! | Kernel | Feature flag | Vector width |
//! |--------|-------------|--------------|
//! | Scalar (Rayon) | `cpu` (default) | 1 |
//! | SIMD (`wide::f64x4`, Rayon) | always | configurable multiple of 4 |
//! | GPU (wgpu) | `gpu` | 64 |
//!
//! ## Communicators
//!
//! [`LocalWorld`](distributed::LocalWorld) runs every rank as a thread of
//! the current process. With the `mpi` feature, `MpiComm` runs one rank per
//! MPI process. Other transports plug in by implementing
//! [`Communicator`](distributed::Communicator).

pub mod backend;
pub mod data;
pub mod distributed;
pub mod simd;

mod pool;

#[cfg(feature = "cpu")]
pub mod cpu;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use backend::{create_kernel, BackendType, ComputeError, DeviceInfo, EvalKernel, KernelKind};
pub use data::{patched_size, Dataset, GridData};
pub use distributed::{CommError, Communicator, LocalComm, LocalWorld, RecvRequest, WindowId};
pub use simd::SimdKernel;

#[cfg(feature = "cpu")]
pub use cpu::CpuKernel;

#[cfg(feature = "gpu")]
pub use gpu::GpuKernel;

#[cfg(feature = "mpi")]
pub use distributed::MpiComm;
