//! Compilation targets.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86,
    NvGpu,
}

/// Hardware description consulted by the schedules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub arch: Arch,
    pub max_threads_per_block: usize,
    pub warp_size: usize,
}

impl Target {
    pub fn x86() -> Self {
        Self {
            arch: Arch::X86,
            max_threads_per_block: 1,
            warp_size: 1,
        }
    }

    pub fn nvgpu() -> Self {
        Self {
            arch: Arch::NvGpu,
            max_threads_per_block: 1024,
            warp_size: 32,
        }
    }

    pub fn is_gpu(&self) -> bool {
        self.arch == Arch::NvGpu
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::x86()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.arch {
            Arch::X86 => write!(f, "x86"),
            Arch::NvGpu => write!(
                f,
                "nvgpu(threads={}, warp={})",
                self.max_threads_per_block, self.warp_size
            ),
        }
    }
}
