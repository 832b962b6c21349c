//! Provides the [Close] trait for writers that need to be finalized.

use std::io;

/// A trait for types that need to be finalized.
///
/// This trait is used to finalize operations where this finalization might fail. Using
/// [Close::close] instead of just dropping allows to retrieve potential errors and handle them.
/// Dropping a value without closing it abandons the operation.
pub trait Close {
    fn close(self) -> io::Result<()>;
}
