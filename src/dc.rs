//! Distributed clocks: propagation delay measurement, system time offset,
//! SYNC0/1 start time placement and the cyclic drift filter.

use crate::slave::Slave;
use crate::slave::config::DcConfig;
use crate::fmt;

/// Default drift filter window in cycles.
pub const DEFAULT_DRIFT_WINDOW: u32 = 1024;

/// Largest time base correction applied per window, in ns.
const MAX_ADJUST_NS: i64 = 1000;

/// SYNC0 start times are placed this many cycles into the future so every
/// slave sees the start before it passes.
const START_MARGIN_CYCLES: u64 = 4;

/// Round trip time measured between a slave's port 0 and its last open
/// downstream port.
///
/// The receive time registers latch as the measurement frame passes each
/// port, so the difference covers everything attached downstream of the
/// slave.
fn round_trip(slave: &Slave) -> i64 {
    // Processing order on the chip is port 0 → 3 → 1 → 2; the frame returns
    // into the last forwarding port before leaving through port 0 again
    let mut last_open = None;

    for port in [3u8, 1, 2] {
        if slave.dl_status.forwards(port) {
            last_open = Some(port);
            break;
        }
    }

    let Some(port) = last_open else {
        // Loopback at port 0: nothing downstream
        return 0;
    };

    i64::from(slave.port_receive_times[usize::from(port)])
        .wrapping_sub(i64::from(slave.port_receive_times[0]))
}

/// Compute per-slave propagation delays from the latched port receive times.
///
/// Daisy chain topology is assumed: each slave's delay is its predecessor's
/// plus half the difference of their downstream round trips. Branched
/// topologies (multi-port junctions) get an approximation that still places
/// every slave's delay between its neighbours'.
pub(crate) fn calc_propagation_delays(slaves: &mut [Slave]) {
    if slaves.is_empty() {
        return;
    }

    slaves[0].propagation_delay = 0;

    for i in 1..slaves.len() {
        let rt_prev = round_trip(&slaves[i - 1]);
        let rt_here = round_trip(&slaves[i]);

        let hop = (rt_prev - rt_here) / 2;

        slaves[i].propagation_delay =
            slaves[i - 1].propagation_delay.saturating_add(hop.max(0) as u32);

        fmt::debug!(
            "Slave {}: propagation delay {} ns",
            slaves[i].ring_position,
            slaves[i].propagation_delay
        );
    }
}

/// Place the SYNC0 start time: the next cycle boundary after a safety margin,
/// shifted by the configured offset.
pub(crate) fn sync_start_time(app_time: u64, dc: &DcConfig) -> u64 {
    if dc.sync0_cycle == 0 {
        return 0;
    }

    let cycle = u64::from(dc.sync0_cycle);
    let earliest = app_time + START_MARGIN_CYCLES * cycle;
    let start = earliest.div_ceil(cycle) * cycle;

    start.saturating_add_signed(i64::from(dc.sync0_shift))
}

/// The cyclic drift filter, pulling the master's time base towards the
/// reference slave's clock.
///
/// Each cycle the reference slave's system time is compared against the
/// application time of the previous cycle. The windowed average of the
/// difference's rate of change maintains a persistent per-cycle rate
/// correction; on top of that a one-count spot nudge in the direction of the
/// current difference is applied every cycle. The rate is clamped so a broken
/// reading can never slew the time base by more than [`MAX_ADJUST_NS`] per
/// cycle.
#[derive(Debug)]
pub struct DcFilter {
    /// Cycle period in ns.
    cycle: i64,
    window: u32,

    started: bool,
    prev_diff_raw: i64,
    /// Most recent centred difference in ns, for observability.
    pub last_diff: i64,
    delta_acc: i64,
    diff_acc: i64,
    samples: u32,
    /// Per-cycle rate correction in ns.
    adjust_rate: i64,
    /// Accumulated correction applied to the master time base, in ns.
    pub time_base: i64,
}

impl Default for DcFilter {
    fn default() -> Self {
        Self::new(1_000_000, DEFAULT_DRIFT_WINDOW)
    }
}

impl DcFilter {
    pub fn new(cycle_ns: u64, window: u32) -> Self {
        Self {
            cycle: (cycle_ns.max(1)) as i64,
            window: window.max(1),
            started: false,
            prev_diff_raw: 0,
            last_diff: 0,
            delta_acc: 0,
            diff_acc: 0,
            samples: 0,
            adjust_rate: 0,
            time_base: 0,
        }
    }

    /// Feed one cycle's reference clock reading.
    ///
    /// `prev_app_time` is the application time used for the previous cycle;
    /// `ref_time` is the reference slave's system time read back in the same
    /// cycle. Returns the correction added to the master time base this
    /// cycle.
    pub fn update(&mut self, prev_app_time: u64, ref_time: u64) -> i64 {
        // Drift shows in the low bits; wrapping 32 bit arithmetic like the
        // reference clock's own drift filter
        let diff_raw = i64::from((prev_app_time as u32).wrapping_sub(ref_time as u32) as i32);

        let delta = diff_raw - self.prev_diff_raw;

        self.prev_diff_raw = diff_raw;

        // Centre into (-cycle/2, cycle/2]
        let diff = (diff_raw + self.cycle / 2).rem_euclid(self.cycle) - self.cycle / 2;

        self.last_diff = diff;

        if !self.started {
            // Seed once real readings flow
            self.started = diff != 0;

            return 0;
        }

        self.diff_acc += diff;
        self.delta_acc += delta;
        self.samples += 1;

        if self.samples >= self.window {
            let window = i64::from(self.window);

            // Rounded average drift rate plus one count towards closing the
            // standing difference
            self.adjust_rate += (self.delta_acc + window / 2) / window;
            self.adjust_rate += (self.diff_acc / window).signum();
            self.adjust_rate = self.adjust_rate.clamp(-MAX_ADJUST_NS, MAX_ADJUST_NS);

            fmt::trace!(
                "DC drift window complete: diff {} ns, rate {} ns/cycle",
                diff,
                self.adjust_rate
            );

            self.diff_acc = 0;
            self.delta_acc = 0;
            self.samples = 0;
        }

        let step = self.adjust_rate + diff.signum();

        self.time_base += step;

        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dl_status::DlStatus;

    fn chain_slave(position: u16, t0: u32, t_return: u32, last: bool) -> Slave {
        let mut slave = Slave::new(position);

        slave.dl_status = DlStatus {
            link_port0: true,
            link_port1: !last,
            ..DlStatus::default()
        };
        slave.port_receive_times = [t0, t_return, 0, 0];

        slave
    }

    #[test]
    fn chain_delays() {
        // Wire A→B takes 100ns, B→C 150ns; the loop back retraces both.
        // A sees the frame at 0 and its return at 500, B at 100 and 400, C
        // loops straight back at 250.
        let mut slaves = [
            chain_slave(0, 0, 500, false),
            chain_slave(1, 100, 400, false),
            chain_slave(2, 250, 250, true),
        ];

        calc_propagation_delays(&mut slaves);

        assert_eq!(slaves[0].propagation_delay, 0);
        // (500 - 300) / 2
        assert_eq!(slaves[1].propagation_delay, 100);
        // 100 + (300 - 0) / 2
        assert_eq!(slaves[2].propagation_delay, 250);
    }

    #[test]
    fn start_time_on_cycle_boundary() {
        let dc = DcConfig {
            assign_activate: 0x0300,
            sync0_cycle: 1_000_000,
            sync0_shift: 0,
            sync1_cycle: 0,
            sync1_shift: 0,
        };

        let start = sync_start_time(12_345_678, &dc);

        assert_eq!(start % 1_000_000, 0);
        assert!(start >= 12_345_678 + 4_000_000);

        // Shift moves the pulse off the boundary
        let shifted = sync_start_time(
            12_345_678,
            &DcConfig {
                sync0_shift: 100_000,
                ..dc
            },
        );

        assert_eq!(shifted % 1_000_000, 100_000);
    }

    #[test]
    fn filter_pulls_in_constant_offset() {
        let mut filter = DcFilter::new(1_000_000, 4);

        // Reference clock consistently 300ns behind the master
        let mut offset = 300i64;

        for cycle in 1..=64u64 {
            let master = cycle * 1_000_000;
            let slave = master.saturating_add_signed(-offset);

            let step = filter.update(master, slave);

            // The master applies the correction to its time base, which
            // shrinks the observed offset
            offset -= step;
        }

        // The standing offset is pulled towards zero one count at a time
        assert!(offset.abs() < 300);
        assert!(filter.last_diff.abs() < 300);
    }

    #[test]
    fn filter_rate_is_clamped() {
        let mut filter = DcFilter::new(1_000_000, 2);

        for cycle in 1..32u64 {
            // Reference clock drifting 5000 ns per cycle: well past the clamp
            let master = cycle * 1_000_000;
            let slave = master - cycle * 5_000;

            let step = filter.update(master, slave);

            assert!(step.abs() <= MAX_ADJUST_NS + 1);
        }

        assert!(filter.time_base != 0);
    }
}
