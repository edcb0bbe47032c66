//! Transport-facing codecs that feed the dispatcher.

pub mod h1;
