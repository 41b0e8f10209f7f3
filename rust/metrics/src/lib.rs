//! Sliding-window metrics and the capability-typed usage layer.
//!
//! Every resource declares its supported usage types through
//! [`Capabilities`] and meters operations into O(1) per-usage windows.
//! Resources that record their own operations (batch storage times every
//! read and write on its own paths) embed a [`UsageMeter`]; resources that
//! don't are placed behind a [`Monitored`] wrapper whose caller times the
//! calls, the way the indexer meters its metadata-store reads. Requesting
//! an unsupported usage fails with the supported list either way.

mod usage;
mod window;

pub use usage::*;
pub use window::*;
