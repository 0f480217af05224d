// Reference count guarding the monitor pipeline's lifecycle

/// What a count change means for the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 0 -> 1: the pipeline must start
    Start,
    /// 1 -> 0: the pipeline must stop
    Stop,
    /// Count changed (or a release was ignored) without crossing zero
    None,
}

/// Number of active subscribers; never goes below zero.
#[derive(Debug, Default)]
pub struct SubscriberCount {
    count: usize,
}

impl SubscriberCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self) -> Transition {
        self.count += 1;
        if self.count == 1 {
            Transition::Start
        } else {
            Transition::None
        }
    }

    /// Extra releases are ignored
    pub fn release(&mut self) -> Transition {
        match self.count {
            0 => {
                log::debug!("Ignoring release with no active subscribers");
                Transition::None
            }
            1 => {
                self.count = 0;
                Transition::Stop
            }
            _ => {
                self.count -= 1;
                Transition::None
            }
        }
    }

    pub fn get(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_edges_trigger() {
        let mut count = SubscriberCount::new();
        assert_eq!(count.acquire(), Transition::Start);
        assert_eq!(count.acquire(), Transition::None);
        assert_eq!(count.release(), Transition::None);
        assert_eq!(count.release(), Transition::Stop);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_extra_releases_saturate() {
        let mut count = SubscriberCount::new();
        assert_eq!(count.release(), Transition::None);
        assert_eq!(count.release(), Transition::None);
        assert_eq!(count.get(), 0);

        // Still starts cleanly afterwards
        assert_eq!(count.acquire(), Transition::Start);
        assert_eq!(count.get(), 1);
    }
}
