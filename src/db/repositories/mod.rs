mod readings;

pub use readings::PendingCursor;
