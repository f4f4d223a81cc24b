use std::fmt;
use std::future::Future;

/// The winning candidate and its value.
#[derive(Debug)]
pub struct Success<T> {
    pub index: usize,
    pub value: T,
}

/// Every candidate failed. Errors are kept in the order they were tried.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub errors: Vec<(String, E)>,
}

impl<E: fmt::Display> fmt::Display for Exhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "no candidates");
        }
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|(label, e)| format!("{}: {}", label, e))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Runs `attempt` on each candidate in order until one returns `Ok`.
///
/// `label` names a candidate for the collected error list.
pub async fn first_success<C, T, E, L, F, Fut>(
    candidates: &[C],
    label: L,
    mut attempt: F,
) -> Result<Success<T>, Exhausted<E>>
where
    L: Fn(&C) -> String,
    F: FnMut(usize, &C) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut errors = Vec::new();
    for (index, candidate) in candidates.iter().enumerate() {
        match attempt(index, candidate).await {
            Ok(value) => return Ok(Success { index, value }),
            Err(e) => errors.push((label(candidate), e)),
        }
    }
    Err(Exhausted { errors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn first_candidate_wins_without_trying_others() {
        let calls = AtomicUsize::new(0);
        let result = first_success(
            &["a", "b"],
            |c| c.to_string(),
            |_, c| {
                calls.fetch_add(1, Ordering::SeqCst);
                let c = c.to_string();
                async move { Ok::<_, String>(c) }
            },
        )
        .await
        .unwrap();

        assert_eq!(result.index, 0);
        assert_eq!(result.value, "a");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn falls_through_to_later_candidate() {
        let result = first_success(
            &["broken", "also-broken", "good"],
            |c| c.to_string(),
            |_, c| {
                let c = c.to_string();
                async move {
                    if c == "good" {
                        Ok(c)
                    } else {
                        Err(format!("{} failed", c))
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result.index, 2);
    }

    #[tokio::test]
    async fn exhausted_keeps_errors_in_order() {
        let err = first_success(
            &["x", "y"],
            |c| c.to_string(),
            |i, _| async move { Err::<(), _>(format!("e{}", i)) },
        )
        .await
        .unwrap_err();

        assert_eq!(err.errors.len(), 2);
        assert_eq!(err.errors[0], ("x".to_string(), "e0".to_string()));
        assert_eq!(err.to_string(), "x: e0; y: e1");
    }

    #[tokio::test]
    async fn empty_candidate_list_is_exhausted() {
        let candidates: [&str; 0] = [];
        let err = first_success(
            &candidates,
            |c| c.to_string(),
            |_, _| async { Ok::<(), String>(()) },
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "no candidates");
    }
}
