//! Port error enums that know their domain error code.
//!
//! Each variant declares its `thiserror` message and the [`ErrorCode`] it
//! surfaces as once it crosses into a service:
//!
//! ```rust,ignore
//! define_port_error! {
//!     pub enum DocumentStoreError {
//!         Conflict { id: String } => "document update conflict for {id}" as Conflict,
//!     }
//! }
//! ```
//!
//! The macro emits snake_case constructors taking `impl Into<T>` per field,
//! a `code()` accessor, and `From<PortError> for Error`, so services
//! propagate port failures with `?`.
//!
//! [`ErrorCode`]: crate::domain::ErrorCode

macro_rules! define_port_error {
    (@ctor $variant:ident) => {
        ::paste::paste! {
            pub fn [<$variant:snake>]() -> Self {
                Self::$variant
            }
        }
    };

    (@ctor $variant:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        define_port_error!(@ctor_impl $variant () () $( $field : $ty, )*);
    };

    (@ctor_impl $variant:ident ($($params:tt)*) ($($inits:tt)*) ) => {
        ::paste::paste! {
            pub fn [<$variant:snake>]($($params)*) -> Self {
                Self::$variant { $($inits)* }
            }
        }
    };

    (@ctor_impl $variant:ident ($($params:tt)*) ($($inits:tt)*) $field:ident : $ty:ty, $($rest:tt)*) => {
        define_port_error!(
            @ctor_impl
            $variant
            ($($params)* $field: impl Into<$ty>,)
            ($($inits)* $field: $field.into(),)
            $($rest)*
        );
    };

    (@pattern $variant:ident) => { Self::$variant };
    (@pattern $variant:ident { $($field:ident : $ty:ty),* $(,)? }) => { Self::$variant { .. } };

    (
        $(#[$outer:meta])*
        pub enum $name:ident {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident $( { $($field:ident : $ty:ty),* $(,)? } )? => $message:literal as $code:ident
            ),* $(,)?
        }
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
        pub enum $name {
            $(
                $(#[$variant_meta])*
                #[error($message)]
                $variant $( { $($field : $ty),* } )?,
            )*
        }

        impl $name {
            $(
                define_port_error!(@ctor $variant $( { $($field : $ty),* } )?);
            )*

            /// Domain code this failure surfaces as.
            pub fn code(&self) -> $crate::domain::ErrorCode {
                match self {
                    $(
                        define_port_error!(@pattern $variant $( { $($field : $ty),* } )?) =>
                            $crate::domain::ErrorCode::$code,
                    )*
                }
            }
        }

        impl From<$name> for $crate::domain::Error {
            fn from(error: $name) -> Self {
                Self::new(error.code(), error.to_string())
            }
        }
    };
}

pub(crate) use define_port_error;

#[cfg(test)]
mod tests {
    //! Regression coverage for generated constructors and code mapping.

    use crate::domain::{Error, ErrorCode};

    define_port_error! {
        pub enum FeedCallError {
            Closed => "feed closed" as Unreachable,
            Rejected { feed: String, status: u16 } => "{feed} rejected with {status}" as Unauthorized,
        }
    }

    #[test]
    fn unit_variants_get_nullary_constructors() {
        assert_eq!(FeedCallError::closed().to_string(), "feed closed");
        assert_eq!(FeedCallError::closed().code(), ErrorCode::Unreachable);
    }

    #[test]
    fn constructors_convert_field_arguments() {
        let err = FeedCallError::rejected("tenants", 401_u16);
        assert_eq!(err.to_string(), "tenants rejected with 401");
        assert_eq!(err.code(), ErrorCode::Unauthorized);
    }

    #[test]
    fn conversion_keeps_message_and_code() {
        let error = Error::from(FeedCallError::rejected("users", 403_u16));
        assert_eq!(error.code(), ErrorCode::Unauthorized);
        assert_eq!(error.to_string(), "users rejected with 403");
    }
}
