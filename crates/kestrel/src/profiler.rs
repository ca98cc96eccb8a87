// Profiling: timing events recorded by the graph executor
//
// Executors time plan synthesis (per optimisation phase) and the
// compilation of fused kernels. Events are aggregated by name into a
// report that prints as a table.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One timed event.
#[derive(Debug, Clone)]
pub struct ProfileEvent {
    pub name: String,
    /// e.g. "plan", "pass", "kernel"
    pub category: String,
    pub duration: Duration,
}

/// Collects named timing events.
///
/// ```
/// use kestrel::profiler::Profiler;
///
/// let mut prof = Profiler::new();
/// let start = prof.start_event("specialize");
/// prof.end_event(start, "specialize", "plan");
/// assert_eq!(prof.events().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct Profiler {
    events: Vec<ProfileEvent>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_event(&mut self, _name: &str) -> Instant {
        Instant::now()
    }

    pub fn end_event(&mut self, start: Instant, name: &str, category: &str) {
        self.record(name, category, start.elapsed());
    }

    pub fn record(&mut self, name: &str, category: &str, duration: Duration) {
        self.events.push(ProfileEvent {
            name: name.to_string(),
            category: category.to_string(),
            duration,
        });
    }

    /// Time `f` as event `name`.
    pub fn measure<F, R>(&mut self, name: &str, category: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        self.record(name, category, start.elapsed());
        result
    }

    pub fn events(&self) -> &[ProfileEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn total_time(&self) -> Duration {
        self.events.iter().map(|e| e.duration).sum()
    }

    /// Aggregate events by name, most expensive first.
    pub fn report(&self) -> ProfileReport {
        let mut by_name: HashMap<String, Vec<Duration>> = HashMap::new();
        for ev in &self.events {
            by_name.entry(ev.name.clone()).or_default().push(ev.duration);
        }

        let mut entries: Vec<ProfileEntry> = by_name
            .into_iter()
            .map(|(name, durations)| {
                let count = durations.len();
                let total: Duration = durations.iter().sum();
                ProfileEntry {
                    name,
                    count,
                    total,
                    min: durations.iter().min().copied().unwrap_or_default(),
                    max: durations.iter().max().copied().unwrap_or_default(),
                    avg: total / count.max(1) as u32,
                }
            })
            .collect();
        entries.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));

        ProfileReport {
            entries,
            total: self.total_time(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProfileEntry {
    pub name: String,
    pub count: usize,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
}

/// Aggregated events, printed with `Display`.
#[derive(Debug, Clone)]
pub struct ProfileReport {
    pub entries: Vec<ProfileEntry>,
    pub total: Duration,
}

impl ProfileReport {
    pub fn entry(&self, name: &str) -> Option<&ProfileEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "═".repeat(78);
        writeln!(f, "╔{rule}╗")?;
        writeln!(f, "║{:^78}║", "Kestrel Executor Profile")?;
        writeln!(f, "╠{rule}╣")?;
        writeln!(
            f,
            "║ {:<24} {:>6} {:>12} {:>12} {:>12} {:>6} ║",
            "Event", "Count", "Total", "Avg", "Max", "%"
        )?;
        writeln!(f, "╠{rule}╣")?;
        for entry in &self.entries {
            let pct = if self.total.as_nanos() > 0 {
                entry.total.as_nanos() as f64 / self.total.as_nanos() as f64 * 100.0
            } else {
                0.0
            };
            writeln!(
                f,
                "║ {:<24} {:>6} {:>12} {:>12} {:>12} {:>5.1}% ║",
                truncate_str(&entry.name, 24),
                entry.count,
                format!("{:.2?}", entry.total),
                format!("{:.2?}", entry.avg),
                format!("{:.2?}", entry.max),
                pct
            )?;
        }
        writeln!(f, "╠{rule}╣")?;
        writeln!(f, "║ {:<76} ║", format!("Total: {:.2?}", self.total))?;
        write!(f, "╚{rule}╝")
    }
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}…")
    } else {
        s.to_string()
    }
}

/// Records the time until it is dropped into a shared profiler.
pub struct ScopedTimer {
    profiler: Arc<Mutex<Profiler>>,
    name: String,
    category: String,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(profiler: Arc<Mutex<Profiler>>, name: &str, category: &str) -> Self {
        Self {
            profiler,
            name: name.to_string(),
            category: category.to_string(),
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        if let Ok(mut prof) = self.profiler.lock() {
            prof.record(&self.name, &self.category, elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_measure_and_report() {
        let mut prof = Profiler::new();
        prof.measure("shape", "pass", || thread::sleep(Duration::from_millis(2)));
        prof.measure("shape", "pass", || {});
        prof.measure("fusion", "pass", || {});
        let report = prof.report();
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.entries[0].name, "shape");
        assert_eq!(report.entry("shape").unwrap().count, 2);
        let text = report.to_string();
        assert!(text.contains("Kestrel Executor Profile"));
        assert!(text.contains("fusion"));
    }

    #[test]
    fn test_scoped_timer() {
        let profiler = Arc::new(Mutex::new(Profiler::new()));
        {
            let _t = ScopedTimer::new(profiler.clone(), "build", "plan");
        }
        let prof = profiler.lock().unwrap();
        assert_eq!(prof.events().len(), 1);
        assert_eq!(prof.events()[0].category, "plan");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate_str("abcdef", 4), "abc…");
        assert_eq!(truncate_str("ab", 4), "ab");
    }
}
