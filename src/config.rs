//! Kernel configuration
//!
//! Fixed at boot. The board hands a `KernelConfig` to `Kernel::boot`,
//! which validates it before any object is created.

use crate::error::{KernResult, KernelError};
use crate::types::{Word, MAX_CPUS};

// ============================================================================
// Defaults
// ============================================================================

/// Default scheduling quantum (user lap time)
pub const DEFAULT_QUANTUM_US: u64 = 10_000;

/// Default object table capacity
pub const DEFAULT_MAX_OBJECTS: usize = 4096;

/// Default capability space capacity per protection domain
pub const DEFAULT_MAX_CAPS: usize = 1024;

/// Upper bound for object table and capability space capacities
pub const MAX_TABLE_CAPACITY: usize = 1 << 20;

// ============================================================================
// Kernel Configuration
// ============================================================================

/// Boot-time kernel parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of CPUs driven by this kernel
    pub cpus: usize,
    /// Time-slice length of every scheduling context
    pub quantum_us: u64,
    /// Capacity of the kernel object table
    pub max_objects: usize,
    /// Capacity of each capability space
    pub max_caps: usize,
    /// Lend the caller's priority to the callee during RPC
    pub donation: bool,
    /// Initial instruction pointer of the core thread
    pub core_ip: Word,
    /// Initial stack pointer of the core thread
    pub core_sp: Word,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            quantum_us: DEFAULT_QUANTUM_US,
            max_objects: DEFAULT_MAX_OBJECTS,
            max_caps: DEFAULT_MAX_CAPS,
            donation: false,
            core_ip: 0,
            core_sp: 0,
        }
    }
}

impl KernelConfig {
    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn with_quantum_us(mut self, quantum_us: u64) -> Self {
        self.quantum_us = quantum_us;
        self
    }

    pub fn with_max_objects(mut self, max_objects: usize) -> Self {
        self.max_objects = max_objects;
        self
    }

    pub fn with_max_caps(mut self, max_caps: usize) -> Self {
        self.max_caps = max_caps;
        self
    }

    pub fn with_donation(mut self, donation: bool) -> Self {
        self.donation = donation;
        self
    }

    pub fn with_core_entry(mut self, ip: Word, sp: Word) -> Self {
        self.core_ip = ip;
        self.core_sp = sp;
        self
    }

    /// Check all parameters against their limits
    pub fn validate(&self) -> KernResult<()> {
        if self.cpus == 0 || self.cpus > MAX_CPUS {
            log::error!("config: unsupported cpu count {}", self.cpus);
            return Err(KernelError::InvalidArgument);
        }
        if self.quantum_us == 0 {
            log::error!("config: zero quantum");
            return Err(KernelError::InvalidArgument);
        }
        // The core PD and the core thread occupy two objects.
        if self.max_objects < 2 || self.max_objects > MAX_TABLE_CAPACITY {
            log::error!("config: object capacity {} out of range", self.max_objects);
            return Err(KernelError::InvalidArgument);
        }
        if self.max_caps < 2 || self.max_caps > MAX_TABLE_CAPACITY {
            log::error!("config: capability capacity {} out of range", self.max_caps);
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }
}
