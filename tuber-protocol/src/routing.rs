//! Stable message identifiers for dispatch

/// A message that names its own route
///
/// The identifier is part of the wire contract and must never change for a
/// given message kind. Servers resolve identifiers to handlers once, at
/// registration time.
pub trait Routable {
    fn msg_id(&self) -> u32;
}

impl<T: Routable + ?Sized> Routable for Box<T> {
    fn msg_id(&self) -> u32 {
        (**self).msg_id()
    }
}
