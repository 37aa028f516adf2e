use bitflags::bitflags;

#[derive(Debug)]
pub(crate) struct Ticker {
    tick: u32,
}

impl Ticker {
    pub(crate) fn new() -> Self {
        Self { tick: 0 }
    }

    pub(crate) fn tick<T: TickerData>(&mut self, ctx: &T::Context, data: &T) -> TickerEvents {
        self.tick = self.tick.wrapping_add(1);
        data.check(ctx, self.tick)
    }
}

/// Implemented by the worker loop policy. The ticker only counts, the policy
/// turns a tick into events.
pub(crate) trait TickerData {
    type Context;

    fn check(&self, ctx: &Self::Context, tick: u32) -> TickerEvents;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct TickerEvents: u16 {
        /// Look at the inbox before the local queue on the next lookup.
        const CHECK_INBOX = 1;

        /// The scheduler drained all work and asked workers to exit.
        const SHUTDOWN = 1 << 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::cell::Cell;

    struct EveryN {
        n: u32,
    }

    impl TickerData for EveryN {
        type Context = Cell<bool>;

        fn check(&self, stop: &Cell<bool>, tick: u32) -> TickerEvents {
            if stop.get() {
                return TickerEvents::SHUTDOWN;
            }

            if tick.is_multiple_of(self.n) {
                TickerEvents::CHECK_INBOX
            } else {
                TickerEvents::empty()
            }
        }
    }

    #[rstest]
    #[case::every_tick(1, 10)]
    #[case::n_3(3, 3)]
    #[case::n_31(31, 0)]
    fn test_inbox_interval(#[case] n: u32, #[case] expected: usize) {
        let mut ticker = Ticker::new();
        let stop = Cell::new(false);
        let data = EveryN { n };

        let hits = (0..10)
            .filter(|_| ticker.tick(&stop, &data).contains(TickerEvents::CHECK_INBOX))
            .count();

        assert_eq!(hits, expected);
    }

    #[test]
    fn test_shutdown_takes_precedence() {
        let mut ticker = Ticker::new();
        let stop = Cell::new(true);

        assert_eq!(ticker.tick(&stop, &EveryN { n: 1 }), TickerEvents::SHUTDOWN);
    }
}
