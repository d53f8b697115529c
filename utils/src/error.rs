use core::result;

/// A bare `Result` alias for the I/O layer: most non-blocking callback sites
/// only care whether an operation succeeded, logging the real cause at the
/// point of failure rather than threading it upward.
pub type Result<T = (), E = ()> = result::Result<T, E>;

#[doc(hidden)]
pub trait Ext<T, E> {
	/// Turns an `Err` into a logged side effect and `None`, keeping `Ok`.
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T>;
}

impl<T, E> Ext<T, E> for result::Result<T, E> {
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T> {
		match self {
			Ok(v) => Some(v),
			Err(e) => {
				f(e);
				None
			}
		}
	}
}

#[doc(hidden)]
pub trait ExtOpaque<T> {
	fn some_or(self, f: impl FnOnce()) -> Option<T>;
}

impl<T> ExtOpaque<T> for Option<T> {
	fn some_or(self, f: impl FnOnce()) -> Option<T> {
		match self {
			Some(_) => {}
			None => f(),
		}

		self
	}
}

pub use Ext as _;
