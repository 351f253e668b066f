//! Worker thread creation and CPU placement.

use std::{
    io,
    thread::{self, JoinHandle},
};

use crate::{
    config::{AffinityAlgorithm, AffinityConfig, CpuRange},
    logging::SluiceLogger,
};

/// CPUs `range` selects out of `0..total`. Never empty while `total > 0`.
pub fn cpu_candidates(total: usize, range: CpuRange) -> Vec<usize> {
    let total = total.max(1);
    let half = (total / 2).max(1);
    match range {
        CpuRange::Full => (0..total).collect(),
        CpuRange::Low => (0..half).collect(),
        CpuRange::High if total == 1 => vec![0],
        CpuRange::High => (half..total).collect(),
    }
}

/// CPUs worker `index` should be pinned to.
pub fn placement(
    algorithm: AffinityAlgorithm,
    range: CpuRange,
    total_cpus: usize,
    index: usize,
) -> Vec<usize> {
    let candidates = cpu_candidates(total_cpus, range);
    let pool: Vec<usize> = match algorithm {
        AffinityAlgorithm::Full => return candidates,
        AffinityAlgorithm::RoundRobin => candidates,
        AffinityAlgorithm::Odd | AffinityAlgorithm::Even => {
            let want_odd = algorithm == AffinityAlgorithm::Odd;
            let filtered: Vec<usize> = candidates
                .iter()
                .copied()
                .filter(|cpu| (cpu % 2 == 1) == want_odd)
                .collect();
            if filtered.is_empty() {
                candidates
            } else {
                filtered
            }
        }
    };
    vec![pool[index % pool.len()]]
}

/// Restricts the calling thread to `cpus`.
pub fn pin_to_cpus(cpus: &[usize]) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    unsafe {
        let mut cpu_set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpu_set);
        for &cpu in cpus {
            libc::CPU_SET(cpu, &mut cpu_set);
        }
        let result = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpu_set);
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = cpus;
    Ok(())
}

/// Spawns worker `index` named `name-index`, pinned according to
/// `affinity` before `f` runs. A failed pin is logged and the worker runs
/// unpinned.
pub fn thread_create<F, T>(
    name: &str,
    index: usize,
    affinity: Option<AffinityConfig>,
    f: F,
) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let cpus = affinity
        .map(|a| placement(a.algorithm, a.range, num_cpus::get(), index))
        .unwrap_or_default();
    thread::Builder::new()
        .name(format!("{name}-{index}"))
        .spawn(move || {
            let pinned = if cpus.is_empty() {
                Vec::new()
            } else {
                match pin_to_cpus(&cpus) {
                    Ok(()) => cpus,
                    Err(err) => {
                        SluiceLogger::pin_failed(index, &err);
                        Vec::new()
                    }
                }
            };
            SluiceLogger::worker_started(index, &pinned);
            f()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_split_in_halves() {
        assert_eq!(cpu_candidates(8, CpuRange::Full), (0..8).collect::<Vec<_>>());
        assert_eq!(cpu_candidates(8, CpuRange::Low), vec![0, 1, 2, 3]);
        assert_eq!(cpu_candidates(8, CpuRange::High), vec![4, 5, 6, 7]);
        assert_eq!(cpu_candidates(1, CpuRange::Low), vec![0]);
        assert_eq!(cpu_candidates(1, CpuRange::High), vec![0]);
    }

    #[test]
    fn round_robin_wraps() {
        let picks: Vec<Vec<usize>> = (0..5)
            .map(|i| placement(AffinityAlgorithm::RoundRobin, CpuRange::High, 8, i))
            .collect();
        assert_eq!(picks, vec![vec![4], vec![5], vec![6], vec![7], vec![4]]);
    }

    #[test]
    fn odd_and_even_filter_the_range() {
        let odd: Vec<usize> = (0..3)
            .flat_map(|i| placement(AffinityAlgorithm::Odd, CpuRange::Full, 6, i))
            .collect();
        assert_eq!(odd, vec![1, 3, 5]);
        let even: Vec<usize> = (0..4)
            .flat_map(|i| placement(AffinityAlgorithm::Even, CpuRange::Low, 8, i))
            .collect();
        assert_eq!(even, vec![0, 2, 0, 2]);
        // a single cpu has no odd member
        assert_eq!(placement(AffinityAlgorithm::Odd, CpuRange::Full, 1, 3), vec![0]);
    }

    #[test]
    fn full_gives_the_whole_range() {
        assert_eq!(
            placement(AffinityAlgorithm::Full, CpuRange::Low, 4, 7),
            vec![0, 1]
        );
    }

    #[test]
    fn thread_create_names_and_runs() {
        let handle = thread_create("sluice-test", 2, None, || {
            thread::current().name().map(str::to_owned)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("sluice-test-2"));
    }
}
