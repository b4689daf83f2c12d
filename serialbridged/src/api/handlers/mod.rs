//! Route handlers

pub(crate) mod home;
pub(crate) mod info;
pub(crate) mod socket;
pub(crate) mod upload;
