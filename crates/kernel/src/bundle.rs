use std::fmt::Debug;

/// Generic trait for tensor bundles.
///
/// The array size is encoded in the `Array` associated type rather than as a
/// const generic, so the same bundle can carry burn tensors, host buffers or
/// borrowed views.
pub trait TensorBundle<T: Debug>: Sized + Debug {
    /// The array type for this bundle, e.g. `[T; 5]` for a 5-tensor bundle.
    type Array;
    /// The bundle type with a different element type.
    type Mapped<U: Debug>: TensorBundle<U, Array = Self::ArrayMapped<U>>;
    /// The array type with a different element type.
    type ArrayMapped<U>;

    fn map<U: Debug>(self, f: impl FnMut(T) -> U) -> Self::Mapped<U>;
    fn try_map<U: Debug, Err>(
        self,
        f: impl FnMut(T) -> Result<U, Err>,
    ) -> Result<Self::Mapped<U>, Err>;
    fn into_array(self) -> Self::Array;
    fn from_array(arr: Self::Array) -> Self;
}

/// Declares a tensor bundle struct with automatic [`TensorBundle`] implementation.
///
/// # Example
/// ```ignore
/// tensor_bundle! {
///     /// My bundle of tensors
///     pub struct MyInputs[3] { xq, xk, xv }
/// }
/// ```
///
/// This generates the struct with all fields public, the `TensorBundle<T>`
/// impl and a `borrowed` view of every field.
macro_rules! tensor_bundle {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident [$n:literal] { $first_field:ident $(, $field:ident)* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name<T> {
            pub $first_field: T,
            $(pub $field: T,)*
        }

        impl<T: std::fmt::Debug> $crate::bundle::TensorBundle<T> for $name<T> {
            type Array = [T; $n];
            type Mapped<U: std::fmt::Debug> = $name<U>;
            type ArrayMapped<U> = [U; $n];

            fn map<U: std::fmt::Debug>(self, mut f: impl FnMut(T) -> U) -> $name<U> {
                $name {
                    $first_field: f(self.$first_field),
                    $($field: f(self.$field),)*
                }
            }

            fn try_map<U: std::fmt::Debug, Err>(
                self,
                mut f: impl FnMut(T) -> Result<U, Err>,
            ) -> Result<$name<U>, Err> {
                Ok($name {
                    $first_field: f(self.$first_field)?,
                    $($field: f(self.$field)?,)*
                })
            }

            fn into_array(self) -> [T; $n] {
                [self.$first_field $(, self.$field)*]
            }

            fn from_array(arr: [T; $n]) -> Self {
                let [$first_field $(, $field)*] = arr;
                $name {
                    $first_field,
                    $($field,)*
                }
            }
        }

        impl<T> $name<T> {
            pub fn borrowed(&self) -> $name<&T> {
                $name {
                    $first_field: &self.$first_field,
                    $($field: &self.$field,)*
                }
            }
        }
    };
}

pub(crate) use tensor_bundle;
