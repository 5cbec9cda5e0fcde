use std::error::Error;
use std::fmt;

pub type BoxedError = Box<dyn Error + Send + Sync + 'static>;
pub type BoxedErrorResult<T> = std::result::Result<T, BoxedError>;

/// Single-line rendering of an error and its source chain.
///
/// Meant for structured log fields, where the multi-line `Debug`/report
/// output of an error is too noisy: `outermost: cause: root cause`.
pub struct CompactChain<'a>(&'a (dyn Error + 'static));

impl fmt::Display for CompactChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

pub trait FmtCompact {
    fn fmt_compact(&self) -> CompactChain<'_>;
}

impl<E> FmtCompact for E
where
    E: Error + 'static,
{
    fn fmt_compact(&self) -> CompactChain<'_> {
        CompactChain(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("outer failed")
        }
    }

    impl Error for Outer {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn renders_chain_on_one_line() {
        let err = Outer(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        assert_eq!(err.fmt_compact().to_string(), "outer failed: disk gone");
    }
}
