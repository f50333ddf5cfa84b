//! DNS side of the dns-01 challenge: naming the challenge record and checking that it's visible.

pub mod name;
pub mod validator;

pub use name::{challenge_record_name, normalize_domain};
