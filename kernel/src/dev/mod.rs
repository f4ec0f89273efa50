// Device Layer
//
// Thin device abstractions consumed by the memory subsystem. Only the
// block-device surface needed by swap lives here; real controller drivers
// are provided by the surrounding kernel.

pub mod disk;
