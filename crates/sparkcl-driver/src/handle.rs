//! Opaque identities of native objects.
//!
//! Two handles compare equal exactly when they name the same native object.

use std::fmt;

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            pub const fn from_raw(raw: usize) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }
    };
}

native_handle!(
    /// A memory object.
    MemHandle
);
native_handle!(
    /// A completion event.
    EventHandle
);
native_handle!(
    /// A kernel object.
    KernelHandle
);
native_handle!(
    /// A compiled program.
    ProgramHandle
);
