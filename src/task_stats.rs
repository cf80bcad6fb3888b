use indexmap::IndexMap;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::progress::log_progress;
use crate::runlog::RunLog;
use crate::settings::ProfileOptions;

/// One resource sample (or a running sum/peak of samples).
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct TaskStatsDatum {
    pub cpu: f64,
    pub mem_used: f64,
    pub mem_total: f64,
    pub load: f64,
    pub read_count: u64,
    pub read_gb: f64,
    pub read_gbps: f64,
    pub read_ms: u64,
    pub write_count: u64,
    pub write_gb: f64,
    pub write_gbps: f64,
    pub write_ms: u64,
    pub num_samples: u64,
}

impl TaskStatsDatum {
    pub fn add(&mut self, other: &TaskStatsDatum) {
        self.cpu += other.cpu;
        self.mem_used += other.mem_used;
        self.mem_total += other.mem_total;
        self.load += other.load;
        self.read_count += other.read_count;
        self.read_gb += other.read_gb;
        self.read_gbps += other.read_gbps;
        self.read_ms += other.read_ms;
        self.write_count += other.write_count;
        self.write_gb += other.write_gb;
        self.write_gbps += other.write_gbps;
        self.write_ms += other.write_ms;
        self.num_samples += other.num_samples;
    }

    pub fn peak(&mut self, other: &TaskStatsDatum) {
        self.cpu = self.cpu.max(other.cpu);
        self.mem_used = self.mem_used.max(other.mem_used);
        self.mem_total = self.mem_total.max(other.mem_total);
        self.load = self.load.max(other.load);
        self.read_count = self.read_count.max(other.read_count);
        self.read_gb = self.read_gb.max(other.read_gb);
        self.read_gbps = self.read_gbps.max(other.read_gbps);
        self.read_ms = self.read_ms.max(other.read_ms);
        self.write_count = self.write_count.max(other.write_count);
        self.write_gb = self.write_gb.max(other.write_gb);
        self.write_gbps = self.write_gbps.max(other.write_gbps);
        self.write_ms = self.write_ms.max(other.write_ms);
        self.num_samples = self.num_samples.max(other.num_samples);
    }

    pub fn averaged(&self) -> TaskStatsDatum {
        if self.num_samples == 0 {
            return *self;
        }
        let n = self.num_samples as f64;
        TaskStatsDatum {
            cpu: self.cpu / n,
            mem_used: self.mem_used / n,
            mem_total: self.mem_total / n,
            load: self.load / n,
            read_count: self.read_count,
            read_gb: self.read_gb,
            read_gbps: self.read_gbps / n,
            read_ms: self.read_ms,
            write_count: self.write_count,
            write_gb: self.write_gb,
            write_gbps: self.write_gbps / n,
            write_ms: self.write_ms,
            num_samples: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskRecord {
    pub elapsed: f64,
    pub sum: TaskStatsDatum,
    pub peak: TaskStatsDatum,
}

#[derive(Default)]
struct StatsState {
    stack: Vec<String>,
    status: String,
    stats: IndexMap<Vec<String>, TaskRecord>,
    start_times: IndexMap<Vec<String>, Instant>,
}

static STATE: Lazy<Mutex<StatsState>> = Lazy::new(|| Mutex::new(StatsState::default()));

/// RAII guard for one subtask level of the dotted-name stack.
pub struct SubtaskGuard {
    _private: (),
}

impl Drop for SubtaskGuard {
    fn drop(&mut self) {
        let mut state = STATE.lock().unwrap();
        state.stack.pop();
        state.status.clear();
    }
}

pub fn declare_subtask(name: &str) -> SubtaskGuard {
    let mut state = STATE.lock().unwrap();
    state.stack.push(name.to_string());
    let path = state.stack.join(".");
    drop(state);
    log_progress(format!("phase=task status=started task={path}"));
    SubtaskGuard { _private: () }
}

pub fn declare_subtask_status(status: &str) {
    let mut state = STATE.lock().unwrap();
    state.status = status.to_string();
    let path = state.stack.join(".");
    drop(state);
    log_progress(format!("phase=task status=update task={path} detail={status}"));
}

pub fn current_task_path() -> String {
    STATE.lock().unwrap().stack.join(".")
}

fn record_sample(sample: &TaskStatsDatum) {
    let mut state = STATE.lock().unwrap();
    let key = state.stack.clone();
    let now = Instant::now();
    let start = *state.start_times.entry(key.clone()).or_insert(now);
    let record = state.stats.entry(key).or_default();
    record.sum.add(sample);
    record.peak.peak(sample);
    record.elapsed = now.duration_since(start).as_secs_f64();
}

/// Returns the per-task stats, with child sums and peaks folded into their
/// parents.
pub fn collect_stats() -> IndexMap<Vec<String>, TaskRecord> {
    let state = STATE.lock().unwrap();
    let mut stats = state.stats.clone();
    drop(state);

    let keys: Vec<Vec<String>> = stats.keys().cloned().collect();
    for key in keys.iter().rev() {
        if key.is_empty() {
            continue;
        }
        let parent: Vec<String> = key[..key.len() - 1].to_vec();
        if stats.contains_key(&parent) {
            let child = stats[key].clone();
            let parent_record = stats.get_mut(&parent).unwrap();
            parent_record.sum.add(&child.sum);
            parent_record.peak.peak(&child.peak);
        }
    }
    stats
}

/// Merges stats recorded elsewhere (e.g. shipped back from workers) that are
/// not yet present locally.
pub fn add_missing_stats(stats: &IndexMap<Vec<String>, TaskRecord>) {
    let mut state = STATE.lock().unwrap();
    for (key, record) in stats {
        if !state.stats.contains_key(key) {
            state.stats.insert(key.clone(), record.clone());
        }
    }
}

pub fn reset_stats() {
    let mut state = STATE.lock().unwrap();
    state.stats.clear();
    state.start_times.clear();
}

#[derive(Debug, Default, Clone, Copy)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct DiskTotals {
    read_count: u64,
    read_sectors: u64,
    read_ms: u64,
    write_count: u64,
    write_sectors: u64,
    write_ms: u64,
}

fn read_cpu_times() -> Option<CpuTimes> {
    let content = std::fs::read_to_string("/proc/stat").ok()?;
    let line = content.lines().next()?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();
    Some(CpuTimes { busy: total - idle, total })
}

fn read_meminfo() -> Option<(f64, f64)> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb = 0u64;
    let mut available_kb = 0u64;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.trim().split_whitespace().next()?.parse().ok()?;
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.trim().split_whitespace().next()?.parse().ok()?;
        }
    }
    let total_gb = total_kb as f64 / (1 << 20) as f64;
    let used_gb = (total_kb.saturating_sub(available_kb)) as f64 / (1 << 20) as f64;
    Some((used_gb, total_gb))
}

fn read_loadavg() -> f64 {
    std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|f| f.parse().ok()))
        .unwrap_or(0.0)
}

fn read_diskstats() -> DiskTotals {
    let mut totals = DiskTotals::default();
    let Ok(content) = std::fs::read_to_string("/proc/diskstats") else {
        return totals;
    };
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 14 {
            continue;
        }
        // skip partitions: device names ending in a digit that also have a
        // parent device entry are close enough to partitions for metering
        let name = fields[2];
        if name.starts_with("loop") || name.starts_with("ram") {
            continue;
        }
        if name.chars().last().is_some_and(|c| c.is_ascii_digit()) {
            continue;
        }
        let get = |i: usize| fields.get(i).and_then(|f| f.parse::<u64>().ok()).unwrap_or(0);
        totals.read_count += get(3);
        totals.read_sectors += get(5);
        totals.read_ms += get(6);
        totals.write_count += get(7);
        totals.write_sectors += get(9);
        totals.write_ms += get(10);
    }
    totals
}

/// Background sampler: captures CPU%, memory, load and disk-I/O deltas once
/// a second and accumulates them against the current task stack.
pub struct Sampler {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Sampler {
    pub fn start() -> Sampler {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::spawn(move || {
            let mut prev_cpu = read_cpu_times();
            let mut prev_disk = read_diskstats();
            let mut prev_time = Instant::now();
            while !stop_flag.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(1));
                let mut sample = TaskStatsDatum { num_samples: 1, ..TaskStatsDatum::default() };

                if let (Some(prev), Some(now)) = (prev_cpu, read_cpu_times()) {
                    let busy = now.busy.saturating_sub(prev.busy) as f64;
                    let total = now.total.saturating_sub(prev.total) as f64;
                    if total > 0.0 {
                        sample.cpu = 100.0 * busy / total;
                    }
                    prev_cpu = Some(now);
                }
                if let Some((used, total)) = read_meminfo() {
                    sample.mem_used = used;
                    sample.mem_total = total;
                }
                sample.load = read_loadavg();

                let disk = read_diskstats();
                let elapsed = prev_time.elapsed().as_secs_f64().max(1e-3);
                sample.read_count = disk.read_count.saturating_sub(prev_disk.read_count);
                sample.write_count = disk.write_count.saturating_sub(prev_disk.write_count);
                sample.read_gb = disk.read_sectors.saturating_sub(prev_disk.read_sectors) as f64
                    * 512.0
                    / (1u64 << 30) as f64;
                sample.write_gb = disk.write_sectors.saturating_sub(prev_disk.write_sectors) as f64
                    * 512.0
                    / (1u64 << 30) as f64;
                sample.read_gbps = sample.read_gb / elapsed;
                sample.write_gbps = sample.write_gb / elapsed;
                sample.read_ms = disk.read_ms.saturating_sub(prev_disk.read_ms);
                sample.write_ms = disk.write_ms.saturating_sub(prev_disk.write_ms);
                prev_disk = disk;
                prev_time = Instant::now();

                record_sample(&sample);
                log_progress(format!(
                    "phase=stats cpu={:.1} mem={:.1}/{:.0}G load={:.1} task={}",
                    sample.cpu,
                    sample.mem_used,
                    sample.mem_total,
                    sample.load,
                    current_task_path()
                ));
            }
        });
        Sampler { stop, handle: Some(handle) }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn format_elapsed(secs: f64) -> String {
    let hours = (secs / 3600.0) as u64;
    let mins = ((secs / 60.0) as u64) % 60;
    let rest = secs % 60.0;
    format!("{hours}:{mins:02}:{rest:04.1}")
}

/// Renders a human-readable summary table (averages and peaks per task).
pub fn render_summary(
    stats: &IndexMap<Vec<String>, TaskRecord>,
    options: &ProfileOptions,
) -> String {
    let mut lines = vec![format!(
        "{:<40} {:>10} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "task", "time hms", "CPU %", "peak %", "Mem GB", "peak GB", "Load", "R GB", "W GB"
    )];
    for (name, record) in stats {
        if name.is_empty() || name.len() > options.print_depth {
            continue;
        }
        if !options.unroll_loops && name.iter().any(|n| n.ends_with(')')) {
            continue;
        }
        let avg = record.sum.averaged();
        lines.push(format!(
            "{:<40} {:>10} {:>8.1} {:>8.1} {:>8.1} {:>8.1} {:>8.1} {:>8.2} {:>8.2}",
            name.join("."),
            format_elapsed(record.elapsed),
            avg.cpu,
            record.peak.cpu,
            avg.mem_used,
            record.peak.mem_used,
            avg.load,
            record.sum.read_gb,
            record.sum.write_gb,
        ));
    }
    lines.join("\n")
}

/// Saves the collected stats: machine-readable YAML, a CSV table, and the
/// rendered text summary, all in the run's log directory.
pub fn save_stats(log: &RunLog, options: &ProfileOptions) -> Result<(), std::io::Error> {
    let stats = collect_stats();
    let dir = log.logdir().map(|p| p.to_path_buf()).unwrap_or_else(|| ".".into());

    #[derive(Serialize)]
    struct StatsEntry {
        elapsed: f64,
        avg: TaskStatsDatum,
        peak: TaskStatsDatum,
    }
    let mut yaml_map: IndexMap<String, StatsEntry> = IndexMap::new();
    for (name, record) in &stats {
        if name.is_empty() {
            continue;
        }
        yaml_map.insert(
            name.join("."),
            StatsEntry { elapsed: record.elapsed, avg: record.sum.averaged(), peak: record.peak },
        );
    }
    let yaml_path = dir.join("stimela.stats.yaml");
    std::fs::write(&yaml_path, serde_yaml::to_string(&yaml_map).unwrap_or_default())?;

    let csv_path = dir.join("stimela.stats.csv");
    let mut writer = csv::Writer::from_path(&csv_path)?;
    writer.write_record([
        "task", "elapsed", "cpu_avg", "cpu_peak", "mem_avg_gb", "mem_peak_gb", "load_avg",
        "read_gb", "write_gb",
    ])?;
    for (name, record) in &stats {
        if name.is_empty() {
            continue;
        }
        let avg = record.sum.averaged();
        writer.write_record([
            name.join("."),
            format!("{:.1}", record.elapsed),
            format!("{:.1}", avg.cpu),
            format!("{:.1}", record.peak.cpu),
            format!("{:.2}", avg.mem_used),
            format!("{:.2}", record.peak.mem_used),
            format!("{:.1}", avg.load),
            format!("{:.3}", record.sum.read_gb),
            format!("{:.3}", record.sum.write_gb),
        ])?;
    }
    writer.flush()?;

    let summary = render_summary(&stats, options);
    std::fs::write(dir.join("stimela.stats.summary.txt"), &summary)?;
    log.info(format!("saved profiling stats to {}", yaml_path.display()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_and_peak_accumulate() {
        let mut sum = TaskStatsDatum::default();
        let mut peak = TaskStatsDatum::default();
        let a = TaskStatsDatum { cpu: 10.0, mem_used: 2.0, num_samples: 1, ..TaskStatsDatum::default() };
        let b = TaskStatsDatum { cpu: 30.0, mem_used: 1.0, num_samples: 1, ..TaskStatsDatum::default() };
        sum.add(&a);
        sum.add(&b);
        peak.peak(&a);
        peak.peak(&b);
        assert_eq!(sum.cpu, 40.0);
        assert_eq!(sum.num_samples, 2);
        assert_eq!(peak.cpu, 30.0);
        assert_eq!(peak.mem_used, 2.0);
        let avg = sum.averaged();
        assert_eq!(avg.cpu, 20.0);
    }

    #[test]
    fn subtask_stack_and_parent_folding() {
        reset_stats();
        {
            let _a = declare_subtask("recipe");
            record_sample(&TaskStatsDatum { cpu: 10.0, num_samples: 1, ..TaskStatsDatum::default() });
            {
                let _b = declare_subtask("step1");
                record_sample(&TaskStatsDatum {
                    cpu: 50.0,
                    num_samples: 1,
                    ..TaskStatsDatum::default()
                });
            }
        }
        let stats = collect_stats();
        let recipe = &stats[&vec!["recipe".to_string()]];
        // the child's sum folded into the parent
        assert_eq!(recipe.sum.cpu, 60.0);
        assert_eq!(recipe.peak.cpu, 50.0);
        let step = &stats[&vec!["recipe".to_string(), "step1".to_string()]];
        assert_eq!(step.sum.cpu, 50.0);
        reset_stats();
    }

    #[test]
    fn save_writes_report_trio() {
        reset_stats();
        {
            let _a = declare_subtask("job");
            record_sample(&TaskStatsDatum { cpu: 25.0, num_samples: 1, ..TaskStatsDatum::default() });
        }
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::with_file("job", dir.path(), "{fqname}.log", crate::runlog::Severity::Info)
            .unwrap();
        save_stats(&log, &ProfileOptions::default()).unwrap();
        assert!(dir.path().join("stimela.stats.yaml").is_file());
        assert!(dir.path().join("stimela.stats.csv").is_file());
        assert!(dir.path().join("stimela.stats.summary.txt").is_file());
        reset_stats();
    }
}
