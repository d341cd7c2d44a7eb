/// Result of applying one overlay transform.
///
/// A transform either produces the next value of the fold or asks to be retired.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Transform<T> {
	/// Replace the folded value with this one and keep the overlay active.
	Continue(T),
	/// Retire the overlay; the fold continues with the unchanged value.
	Stop,
}

impl<T> Transform<T> {
	/// Returns true for [`Transform::Stop`].
	pub fn is_stop(&self) -> bool {
		matches!(self, Self::Stop)
	}

	/// Returns the continued value, if any.
	pub fn into_continue(self) -> Option<T> {
		match self {
			Self::Continue(value) => Some(value),
			Self::Stop => None,
		}
	}

	/// Maps the continued value.
	pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Transform<U> {
		match self {
			Self::Continue(value) => Transform::Continue(f(value)),
			Self::Stop => Transform::Stop,
		}
	}
}

/// Verdict of a caller-supplied matcher comparing an authoritative element with
/// the effect of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
	/// The element is unrelated to the operation.
	No,
	/// The element is the confirmed result of the operation.
	Exact,
	/// The element probably is the operation's result, but identity is not confirmed yet.
	Fuzzy,
	/// The matcher cannot decide. Treated as [`Reconciliation::No`].
	Undecided,
}

impl Reconciliation {
	/// Collapses `Undecided` into `No`, keeping the overlay active.
	pub fn resolve(self) -> Self {
		match self {
			Self::Undecided => Self::No,
			other => other,
		}
	}
}

impl From<bool> for Reconciliation {
	fn from(exact: bool) -> Self {
		if exact { Self::Exact } else { Self::No }
	}
}
