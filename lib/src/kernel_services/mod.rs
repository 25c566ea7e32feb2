//! Decoupling seams between the driver stack and its embedding kernel.
//!
//! Each service is a `'static` table of function pointers.  The embedder
//! registers its table once during bring-up; until then every entry is a
//! harmless default, which keeps the stack linkable and testable on targets
//! where the real implementation does not exist.

pub mod driver_runtime;
pub mod platform;

/// Declare a service table: the struct, its defaults, a registration
/// function, and an accessor that falls back to the defaults until a table
/// is registered.
///
/// ```ignore
/// crate::define_service! {
///     platform => PlatformServices {
///         irq_save: fn() -> u64 = defaults::irq_save;
///     }
/// }
/// ```
#[macro_export]
macro_rules! define_service {
    (
        $(#[$attr:meta])*
        $name:ident => $table:ident {
            $( $(#[$fattr:meta])* $field:ident : $fty:ty = $default:expr ; )+
        }
    ) => {
        $crate::paste::paste! {
            $(#[$attr])*
            #[derive(Clone, Copy)]
            pub struct $table {
                $( $(#[$fattr])* pub $field : $fty, )+
            }

            impl $table {
                /// No-op defaults used until a table is registered.
                pub const DEFAULT: $table = $table {
                    $( $field : $default, )+
                };
            }

            static [<$name:upper _TABLE>]: ::core::sync::atomic::AtomicPtr<$table> =
                ::core::sync::atomic::AtomicPtr::new(::core::ptr::null_mut());

            /// Register the service table.  The table must have `'static`
            /// lifetime; registration may happen more than once (tests swap
            /// tables), last registration wins.
            pub fn [<register_ $name _services>](table: &'static $table) {
                [<$name:upper _TABLE>].store(
                    table as *const $table as *mut $table,
                    ::core::sync::atomic::Ordering::Release,
                );
            }

            /// Access the active table, or the defaults if none registered.
            pub fn [<$name _services>]() -> &'static $table {
                let ptr = [<$name:upper _TABLE>].load(::core::sync::atomic::Ordering::Acquire);
                if ptr.is_null() {
                    &$table::DEFAULT
                } else {
                    // SAFETY: registration only stores `'static` references.
                    unsafe { &*ptr }
                }
            }
        }
    };
}
