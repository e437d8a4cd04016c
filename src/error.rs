//! Error taxonomy for the normalized cache.
//!
//! Every fallible path in this crate returns [`CacheError`]. There is no trait-object error type
//! and no retry policy here: callers match on the variant and decide what to do.

/// Create an internal error.
///
/// # Example
/// ```rust
/// use apollo_cache_core::internal_error;
/// use apollo_cache_core::error::CacheError;
/// # fn may_be_none() -> Option<()> { None }
///
/// let result: Result<(), CacheError> = may_be_none()
///     .ok_or_else(|| internal_error!("expected {} to be populated", "the thing"));
/// ```
#[macro_export]
macro_rules! internal_error {
    ( $( $arg:tt )+ ) => {
        $crate::error::CacheError::Internal { message: format!( $( $arg )+ ) }
    }
}

/// Break out of the current function, returning an internal error.
#[macro_export]
macro_rules! bail {
    ( $( $arg:tt )+ ) => {
        return Err($crate::internal_error!( $( $arg )+ ))
    }
}

/// An assertion that should never fail in normal operation: panics in debug builds, returns an
/// internal error otherwise. Use this for invariants, not for validating untrusted input.
#[macro_export]
macro_rules! ensure {
    ( $expr:expr, $( $arg:tt )+ ) => {
        #[cfg(debug_assertions)]
        {
            assert!($expr, $( $arg )+);
        }
        #[cfg(not(debug_assertions))]
        if !$expr {
            $crate::bail!( $( $arg )+ );
        }
    }
}

/// The error kinds a normalized cache can produce, per the core's error handling design.
///
/// Kinds 1 through 5 below are fatal at the call site: there is no recovery path inside the
/// cache. Missing data on read (`PartialData`) is not an error at all — it is reported through
/// [`crate::reader::ReadOutcome::missing`] instead.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum CacheError {
    /// `identify` returned an id beginning with `$`; that namespace is reserved for synthetic
    /// ids generated by the writer.
    #[error("identify() returned \"{id}\", which is reserved for synthetic ids")]
    IdentityViolation { id: String },

    /// A write attempted to replace a durable (real) entity reference with a freshly generated
    /// synthetic one at the same slot.
    #[error(
        "cannot overwrite real reference to \"{existing_id}\" at {path} with a synthetic reference; \
         the application likely stopped supplying an id for an object it previously identified"
    )]
    IdentityOverwrite { existing_id: String, path: String },

    /// A fragment spread named a fragment absent from the fragment map.
    #[error("no fragment named \"{name}\" in the fragment map")]
    MissingFragment { name: String },

    /// A selection kind outside `{Field, InlineFragment, FragmentSpread}`.
    #[error("unknown selection kind: {kind}")]
    UnknownSelection { kind: String },

    /// An argument value-node kind the field-key encoder does not handle.
    #[error("unsupported argument value kind: {kind}")]
    UnsupportedArgumentKind { kind: String },

    /// Something that should be impossible given the taxonomy (e.g. a `Reference` stored for a
    /// field with no sub-selection). Always a bug in this crate or in a caller violating the
    /// selection-set/result-tree contract, never a recoverable user error.
    #[error("an internal error has occurred: {message}")]
    Internal { message: String },
}
