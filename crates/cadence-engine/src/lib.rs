pub mod aggregate;
pub mod backoff;
pub mod batch;
pub mod breaker;
pub mod driver;
pub mod nonblock;
pub mod parallel;
pub mod policy;
pub mod rate_limit;
pub mod retry;
pub mod timeout;
pub mod timer;
pub mod wrap;

pub use aggregate::{aggregate, aggregate_steps, Aggregator};
pub use backoff::{
    backoff, backoff_boxed, delay_strategy, BackOff, Constant, DelayStrategy, Jitter, Linear,
};
pub use batch::{batch, Batch};
pub use breaker::{breaker, breaker_boxed, Breaker, MaxTriesTrip, TimedTrip, TripStrategy};
pub use driver::{run, run_parallel};
pub use nonblock::{non_blocking, NonBlocking};
pub use parallel::{parallel, Parallel};
pub use policy::ResiliencePolicy;
pub use rate_limit::{
    rate_limit, rate_limit_boxed, throttle, FixedWindow, LimitStrategy, RateLimit, Throttle,
};
pub use retry::{retry, Retry};
pub use timeout::{timeout, Timeout};
pub use timer::{after, at, cron, cron_expr, every, After, At, Cron, Every};
pub use wrap::{wrap, wrap_repeat};
