//! Fixed-capacity resource allocators: USF, TFI and uplink block
//! reservations. None of these depend on anything above them; exhaustion
//! is always a normal return value, never an error.

pub mod reservation;
pub mod tfi;
pub mod usf;

pub use reservation::{ResKind, Reservation, ReservationRing};
pub use tfi::TfiTable;
pub use usf::{UsfTable, USF_MAX, USF_MIN};
