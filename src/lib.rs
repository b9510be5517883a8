// PERCENTINEL -- ADAPTIVE UPSTREAM LATENCY PERCENTILE ENGINE
// CONTINUOUS RESPONSE-TIME PERCENTILES FOR A POPULATION OF UPSTREAM SERVERS
//
// REQUEST THREADS ENQUEUE (SERVER, TIMESTAMP, RTT) SAMPLES, NOTHING ELSE.
// ONE AGGREGATOR THREAD DRAINS THE PER-CPU QUEUES, FEEDS THE PER-SERVER
// ADAPTIVE HISTOGRAMS, AND PUBLISHES RECOMPUTED PERCENTILES THROUGH A
// DOUBLE-BUFFERED FLIP-FLOP. READERS NEVER BLOCK WRITERS FOR LONG AND THE
// FAST PATH NEVER BLOCKS AT ALL.
//
// ACCURACY IS TRADED FOR SPEED THROUGHOUT: A QUERY FOR THE 75TH PERCENTILE
// MAY RETURN A VALUE THAT IS REALLY THE 81ST. THAT IS THE CONTRACT.

pub mod clock;
pub mod config;
pub mod engine;
pub mod histogram;
pub mod queue;
pub mod ring;
pub mod stats;

pub use clock::{Clock, ManualClock, DEFAULT_HZ};
pub use config::ApmConfig;
pub use engine::{Aggregator, ApmData, Engine};
pub use stats::{PercentileStats, PSTATS_ITH};

// CACHE LINE WRAPPER -- KEEPS HOT ATOMICS OFF EACH OTHER'S LINES
#[repr(align(64))]
pub(crate) struct CachePadded<T>(pub T);
