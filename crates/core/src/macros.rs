// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Declarative macros for reducing boilerplate.
//!
//! - [`str_display!`] — wire-string mapping for an enum: `as_str()`
//!   plus a `Display` impl delegating to it
//! - [`builder!`] — test builder struct with Default, setters, and
//!   `build()`

/// Map enum variants to their stable wire strings.
///
/// Generates `pub fn as_str(&self) -> &'static str` and a `Display`
/// impl that writes it, so log fields, wire formats, and error text all
/// agree on one spelling. Unit variants match directly; data-carrying
/// variants use `(..)` to ignore fields.
///
/// ```ignore
/// crate::str_display! {
///     MyEnum {
///         Foo => "foo",
///         Bar(..) => "bar",
///     }
/// }
/// ```
#[macro_export]
macro_rules! str_display {
    ($enum:ty { $( $variant:ident $(( $($ignore:tt)* ))? => $str:expr ),+ $(,)? }) => {
        impl $enum {
            /// The stable wire string for this variant.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant $(( $($ignore)* ))? => $str, )+
                }
            }
        }

        impl std::fmt::Display for $enum {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Generate a test builder (struct + Default + setters + build).
///
/// All generated items are gated behind `#[cfg(any(test, feature = "test-support"))]`.
///
/// Field groups:
/// - `field { name: Type = default }` — builder field with an
///   `impl Into<Type>` setter; the default expression is converted with
///   `.into()` at construction
/// - `option { name: Type = default }` — builder field is
///   `Option<Type>`, setter wraps in `Some(v.into())`
/// - `init { name: Type = expr }` — no builder field or setter; the
///   expression runs at build time
///
/// ```ignore
/// crate::builder! {
///     pub struct FooBuilder => Foo {
///         field {
///             name: String = "test",
///             count: u32 = 0u32,
///         }
///         option { label: String = None }
///         init { created_at_ms: u64 = 0 }
///     }
/// }
/// ```
#[macro_export]
macro_rules! builder {
    (
        pub struct $builder:ident => $target:ident {
            $(field {
                $( $field:ident : $field_ty:ty = $field_default:expr ),* $(,)?
            })?
            $(option {
                $( $opt_field:ident : $opt_ty:ty = $opt_default:expr ),* $(,)?
            })?
            $(init {
                $( $init_field:ident : $init_ty:ty = $init_expr:expr ),* $(,)?
            })?
        }
    ) => {
        #[cfg(any(test, feature = "test-support"))]
        pub struct $builder {
            $($( $field: $field_ty, )*)?
            $($( $opt_field: Option<$opt_ty>, )*)?
        }

        #[cfg(any(test, feature = "test-support"))]
        impl Default for $builder {
            fn default() -> Self {
                Self {
                    $($( $field: $field_default.into(), )*)?
                    $($( $opt_field: $opt_default, )*)?
                }
            }
        }

        #[cfg(any(test, feature = "test-support"))]
        impl $builder {
            $($(
                pub fn $field(mut self, v: impl Into<$field_ty>) -> Self {
                    self.$field = v.into();
                    self
                }
            )*)?

            $($(
                pub fn $opt_field(mut self, v: impl Into<$opt_ty>) -> Self {
                    self.$opt_field = Some(v.into());
                    self
                }
            )*)?

            pub fn build(self) -> $target {
                $target {
                    $($( $field: self.$field, )*)?
                    $($( $opt_field: self.$opt_field, )*)?
                    $($( $init_field: $init_expr, )*)?
                }
            }
        }

        #[cfg(any(test, feature = "test-support"))]
        impl $target {
            /// Create a builder with test defaults.
            pub fn builder() -> $builder {
                $builder::default()
            }
        }
    };
}
