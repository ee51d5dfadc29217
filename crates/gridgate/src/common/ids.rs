use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};

macro_rules! define_id_type {
    ($name:ident, $inner:ty) => {
        #[derive(
            Copy, Clone, Default, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize,
        )]
        pub struct $name($inner);

        impl $name {
            #[inline]
            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            #[inline]
            pub const fn as_num(&self) -> $inner {
                self.0
            }
        }

        impl From<$inner> for $name {
            #[inline]
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                Display::fmt(self, f)
            }
        }
    };
}

define_id_type!(ResourceId, u32);
define_id_type!(TimerId, u64);
define_id_type!(CredentialId, u64);
define_id_type!(WatchToken, u64);

/// Identifies one job: the (cluster, proc) pair assigned by the submission
/// service. Immutable for the whole life of the job.
#[derive(Copy, Clone, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobId {
    cluster: u32,
    proc: u32,
}

impl JobId {
    #[inline]
    pub fn new(cluster: u32, proc: u32) -> Self {
        Self { cluster, proc }
    }

    #[inline]
    pub fn cluster(&self) -> u32 {
        self.cluster
    }

    #[inline]
    pub fn proc(&self) -> u32 {
        self.proc
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.cluster, self.proc)
    }
}

impl Debug for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// Monotonic counter handing out fresh ids of any `define_id_type` kind.
pub struct IdCounter(u64);

impl IdCounter {
    pub fn new(initial_value: u64) -> Self {
        Self(initial_value)
    }

    pub fn increment(&mut self) -> u64 {
        let value = self.0;
        self.0 += 1;
        value
    }
}

impl Default for IdCounter {
    fn default() -> Self {
        Self::new(1)
    }
}
