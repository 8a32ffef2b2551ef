use std::fmt::Display;

/// Error types that can fold several step failures into one value.
pub trait Joinable: Sized {
    fn joined(errors: Vec<Self>) -> Self;
}

/// Turn the errors gathered by a multi-step teardown into a single result.
/// Every step is attempted before this is called.
pub fn collect_errors<E: Joinable>(mut errors: Vec<E>) -> Result<(), E> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(E::joined(errors)),
    }
}

pub(crate) fn format_joined<E: Display>(errors: &[E]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
