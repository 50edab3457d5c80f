use std::fmt;

/// Which device the pipeline should be placed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    /// Accelerator ordinal; falls back to the CPU when no accelerator backend is compiled in.
    Ordinal(usize),
}

impl DeviceMap {
    pub fn new(cpu: bool, ordinal: usize) -> Self {
        if cpu {
            Self::ForceCpu
        } else {
            Self::Ordinal(ordinal)
        }
    }
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForceCpu => write!(f, "cpu"),
            Self::Ordinal(ordinal) => write!(f, "accelerator:{ordinal}"),
        }
    }
}
