// Filesystem Layer
//
// The memory subsystem consumes files only through the narrow handle
// surface in `file`; the real on-disk filesystem is provided by the
// surrounding kernel.

pub mod file;
