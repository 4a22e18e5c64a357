//! Passes as an ordered list of named trait objects rather than a tagged
//! union. [`WebPass`], [`WsPass`] and [`WebOutgoingPass`] are the three pass
//! traits for the three pipelines; [`insert_before`]/[`insert_after`]
//! implement the identity-by-name splicing `ProxyServer::before`/`after`
//! expose.

use crate::error::ProxyError;

/// Returning `Halt` stops the pipeline and supplies the final value; a
/// pass that returns `Continue` defers to the next one in the list.
pub enum PassOutcome<T> {
    Continue,
    Halt(T),
}

/// Shared by all three pass traits so [`insert_before`]/[`insert_after`]
/// can be written once, generically, instead of three times.
pub trait Named {
    /// Identity used by `before`/`after`. Stable across a pass's lifetime;
    /// two passes sharing a name is allowed, and `before`/`after` target
    /// the *last* match.
    fn name(&self) -> &'static str;
}

/// Insert `new_pass` immediately before the last pass named `target_name`.
/// Errors with [`ProxyError::NoSuchPass`] if no pass has that name.
pub fn insert_before<P: Named + ?Sized>(
    list: &mut Vec<Box<P>>,
    target_name: &str,
    new_pass: Box<P>,
) -> Result<(), ProxyError> {
    let idx = list
        .iter()
        .rposition(|p| p.name() == target_name)
        .ok_or_else(|| ProxyError::NoSuchPass(target_name.to_string()))?;
    list.insert(idx, new_pass);
    Ok(())
}

/// Insert `new_pass` immediately after the last pass named `target_name`.
pub fn insert_after<P: Named + ?Sized>(
    list: &mut Vec<Box<P>>,
    target_name: &str,
    new_pass: Box<P>,
) -> Result<(), ProxyError> {
    let idx = list
        .iter()
        .rposition(|p| p.name() == target_name)
        .ok_or_else(|| ProxyError::NoSuchPass(target_name.to_string()))?;
    list.insert(idx + 1, new_pass);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);
    impl Named for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }
    }

    #[test]
    fn before_splices_ahead_of_named_pass() {
        let mut list: Vec<Box<Fixed>> = vec![Box::new(Fixed("a")), Box::new(Fixed("b"))];
        insert_before(&mut list, "b", Box::new(Fixed("x"))).unwrap();
        let names: Vec<_> = list.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["a", "x", "b"]);
    }

    #[test]
    fn after_splices_behind_named_pass() {
        let mut list: Vec<Box<Fixed>> = vec![Box::new(Fixed("a")), Box::new(Fixed("b"))];
        insert_after(&mut list, "a", Box::new(Fixed("x"))).unwrap();
        let names: Vec<_> = list.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["a", "x", "b"]);
    }

    #[test]
    fn missing_pass_name_is_an_error() {
        let mut list: Vec<Box<Fixed>> = vec![Box::new(Fixed("a"))];
        assert!(insert_before(&mut list, "nope", Box::new(Fixed("x"))).is_err());
    }

    #[test]
    fn duplicate_names_target_the_last_match() {
        let mut list: Vec<Box<Fixed>> = vec![
            Box::new(Fixed("a")),
            Box::new(Fixed("dup")),
            Box::new(Fixed("dup")),
        ];
        insert_after(&mut list, "dup", Box::new(Fixed("x"))).unwrap();
        let names: Vec<_> = list.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["a", "dup", "dup", "x"]);
    }
}
