/// Destroys values once a reclamation manager has proven nobody can still reach them.
///
/// The deleter is a strategy value handed to the manager at construction and invoked for
/// every reclaimed value, including the ones still retired when the manager is dropped.
/// Any `Fn(T)` closure is a deleter.
pub trait Deleter<T> {
    fn delete(&self, value: T);
}

/// The default deleter, it simply drops the value.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropDeleter;

impl<T> Deleter<T> for DropDeleter {
    #[inline]
    fn delete(&self, value: T) {
        drop(value);
    }
}

impl<T, F> Deleter<T> for F
where
    F: Fn(T),
{
    #[inline]
    fn delete(&self, value: T) {
        self(value)
    }
}
