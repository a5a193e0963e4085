use std::{
    borrow::Borrow,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Opaque identifier the server hands out when a tunnel opens.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(Arc<str>);

impl TunnelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TunnelId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl From<&str> for TunnelId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl Borrow<str> for TunnelId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelId({})", self.0)
    }
}

/// Source of the per-server part of tunnel ids. Implementations must never
/// repeat a value for the lifetime of the server that owns them.
pub trait TunnelIdGenerator: Send + Sync + 'static {
    fn generate_id(&self) -> String;
}

#[derive(Debug, Default)]
pub struct SequentialTunnelIdGenerator {
    next: AtomicU64,
}

impl TunnelIdGenerator for SequentialTunnelIdGenerator {
    fn generate_id(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn sequential_ids_never_repeat() {
        let generator = Arc::new(SequentialTunnelIdGenerator::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = Arc::clone(&generator);
                std::thread::spawn(move || {
                    (0..250).map(|_| generator.generate_id()).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
