//! Commands run on behalf of an authenticated key.

pub mod two_factor_recovery;
