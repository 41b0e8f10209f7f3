mod cell_state;
mod metadata;
mod molecule;
mod run_id;
mod wire;

pub use cell_state::*;
pub use metadata::*;
pub use molecule::*;
pub use run_id::*;
pub use wire::*;
