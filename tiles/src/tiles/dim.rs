use std::marker::PhantomData;

use crate::LINE_SIZE;

/// A tile extent fixed at compile time.
///
/// Every kernel instantiation picks its tile rows, key rows and maximum head
/// dim from a small set, so those extents are types rather than fields.
pub trait Dim: Clone + Copy + std::fmt::Debug + Send + Sync + 'static {
    const VALUE: usize;
}

macro_rules! dims {
    ($($name:ident = $value:literal),* $(,)?) => {
        $(
            #[doc = concat!("Extent of ", stringify!($value), ".")]
            #[derive(Clone, Copy, Debug)]
            pub struct $name;

            impl Dim for $name {
                const VALUE: usize = $value;
            }
        )*
    };
}

dims!(D4 = 4, D8 = 8, D16 = 16, D32 = 32, D64 = 64, D128 = 128);

const _: () = assert!(D4::VALUE == LINE_SIZE, "the narrowest tile must be one line wide");

/// Zero-sized carrier of a tile's row and column extents.
pub type DimPhantom<R, C> = PhantomData<(R, C)>;
