//! Small shared helpers.

/// Runs a closure on the error arm of a [`Result`] without consuming
/// it, for logging at the point of propagation.
pub(crate) trait OnError<E>
where
    E: std::fmt::Display,
{
    /// Calls `f` with the error, then returns `self` unchanged.
    #[must_use]
    fn on_err<F>(self, f: F) -> Self
    where
        F: FnOnce(&E);
}

impl<T, E> OnError<E> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn on_err<F>(self, f: F) -> Self
    where
        F: FnOnce(&E),
    {
        if let Err(err) = &self {
            f(err);
        }
        self
    }
}
