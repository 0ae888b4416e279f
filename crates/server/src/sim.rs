//! Simulated robot.
//!
//! Three firmware timers run on a virtual AVR clock driven by its own
//! thread:
//!
//! - ACS: 2 ms pulse timer; raises the left/right obstacle bits of the
//!   state-sensor byte during fixed windows of its pulse count
//! - Motor control: 10 ms loop ramping each side's speed toward its
//!   destination speed and integrating distance
//! - Battery: 8 s timer draining the battery reading down to a floor
//!
//! Every value crosses to the main loop through a [`SharedValue`]; the main
//! loop turns changed values into frames.

use anyhow::Context;
use rp6_remote_core::clock::{AvrClock, ClockCommand, ClockDriver, ClockError, CpuUsage, SharedValue};
use rp6_remote_core::protocol::DataWidth;
use rp6_remote_core::{savestate, Message, Opcode};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// State-sensor bits
pub const ACS_LEFT: u32 = 0x04;
pub const ACS_RIGHT: u32 = 0x08;
/// Motor-direction bits (set = backwards)
pub const DIR_LEFT_BWD: u32 = 0x01;
pub const DIR_RIGHT_BWD: u32 = 0x02;

const ACS_COMPARE: u32 = 250;
const ACS_PRESCALER: u32 = 64;
const MOTOR_COMPARE: u32 = 1250;
const MOTOR_PRESCALER: u32 = 64;
const BATTERY_COMPARE: u32 = 62_500;
const BATTERY_PRESCALER: u32 = 1024;

const ACS_WINDOW: u32 = 1000;
const MAX_SPEED: u32 = 200;
const SPEED_RAMP: u32 = 2;
const BATTERY_FULL: u32 = 800;
const BATTERY_FLOOR: u32 = 550;

const CLOCK_STOPPED: &str = "clock thread is not running";

#[derive(Debug, Clone, Default)]
pub struct SimValues {
    pub state_sensors: SharedValue,
    pub motor_dirs: SharedValue,
    pub speed_left: SharedValue,
    pub speed_right: SharedValue,
    pub dest_speed_left: SharedValue,
    pub dest_speed_right: SharedValue,
    pub dist_left: SharedValue,
    pub dist_right: SharedValue,
    pub current_left: SharedValue,
    pub current_right: SharedValue,
    pub battery: SharedValue,
    pub light_left: SharedValue,
    pub light_right: SharedValue,
    pub acs_power: SharedValue,
}

impl SimValues {
    pub fn new() -> Self {
        let v = SimValues::default();
        v.battery.set(BATTERY_FULL);
        v.light_left.set(400);
        v.light_right.set(380);
        v.acs_power.set(1);
        v
    }

    fn table(&self) -> [(Opcode, &SharedValue); 14] {
        [
            (Opcode::StateSensors, &self.state_sensors),
            (Opcode::MotorDirections, &self.motor_dirs),
            (Opcode::MotorSpeedLeft, &self.speed_left),
            (Opcode::MotorSpeedRight, &self.speed_right),
            (Opcode::MotorDestSpeedLeft, &self.dest_speed_left),
            (Opcode::MotorDestSpeedRight, &self.dest_speed_right),
            (Opcode::MotorDistLeft, &self.dist_left),
            (Opcode::MotorDistRight, &self.dist_right),
            (Opcode::MotorCurrentLeft, &self.current_left),
            (Opcode::MotorCurrentRight, &self.current_right),
            (Opcode::Battery, &self.battery),
            (Opcode::LightLeft, &self.light_left),
            (Opcode::LightRight, &self.light_right),
            (Opcode::AcsPower, &self.acs_power),
        ]
    }
}

fn to_message(op: Opcode, value: u32) -> Message {
    match op.standard_width() {
        Some(DataWidth::Byte) => Message::byte(op, value.min(u8::MAX as u32) as u8),
        _ => Message::word(op, (value & 0xFFFF) as u16),
    }
}

fn ramp(current: u32, dest: u32) -> u32 {
    if current < dest {
        (current + SPEED_RAMP).min(dest)
    } else {
        current.saturating_sub(SPEED_RAMP).max(dest)
    }
}

/// Register the robot's timers. Registration order fixes the handle ids,
/// which save states rely on.
pub fn install_timers(clock: &mut AvrClock, v: &SimValues) -> Result<(), ClockError> {
    let state = v.state_sensors.clone();
    let power = v.acs_power.clone();
    let mut pulses = 0u32;
    let acs = clock.create_timer(move |_| {
        pulses = (pulses + 1) % ACS_WINDOW;
        let mut bits = state.get() & !(ACS_LEFT | ACS_RIGHT);
        if power.get() != 0 {
            if (200..260).contains(&pulses) {
                bits |= ACS_LEFT;
            }
            if (600..660).contains(&pulses) {
                bits |= ACS_RIGHT;
            }
        }
        state.set(bits);
    });
    clock.set_prescaler(acs, ACS_PRESCALER)?;
    clock.set_compare_value(acs, ACS_COMPARE)?;
    clock.enable_timer(acs, true)?;

    let sides = [
        (v.speed_left.clone(), v.dest_speed_left.clone(), v.dist_left.clone(), v.current_left.clone()),
        (v.speed_right.clone(), v.dest_speed_right.clone(), v.dist_right.clone(), v.current_right.clone()),
    ];
    let mut travelled = [0u32; 2];
    let motor = clock.create_timer(move |_| {
        for (i, (speed, dest, dist, current)) in sides.iter().enumerate() {
            let s = ramp(speed.get(), dest.get().min(MAX_SPEED));
            speed.set(s);
            current.set(s * 3 / 2);
            // One distance count per 20 speed units per loop
            travelled[i] += s;
            dist.set(dist.get().wrapping_add(travelled[i] / 20));
            travelled[i] %= 20;
        }
    });
    clock.set_prescaler(motor, MOTOR_PRESCALER)?;
    clock.set_compare_value(motor, MOTOR_COMPARE)?;
    clock.enable_timer(motor, true)?;

    let battery = v.battery.clone();
    let drain = clock.create_timer(move |_| {
        let b = battery.get();
        if b > BATTERY_FLOOR {
            battery.set(b - 1);
        }
    });
    clock.set_prescaler(drain, BATTERY_PRESCALER)?;
    clock.set_compare_value(drain, BATTERY_COMPARE)?;
    clock.enable_timer(drain, true)?;
    Ok(())
}

pub struct SimRobot {
    values: SimValues,
    driver: ClockDriver,
    sent: HashMap<Opcode, u32>,
}

impl SimRobot {
    pub fn start(clock_speed: u64, cpu_usage: CpuUsage, load_state: Option<&Path>) -> anyhow::Result<Self> {
        let values = SimValues::new();
        let mut clock = AvrClock::new();
        clock.set_target_clock_speed(clock_speed);
        clock.set_cpu_usage(cpu_usage);
        install_timers(&mut clock, &values)?;

        if let Some(path) = load_state {
            let snapshot = savestate::load_from_file(path)
                .with_context(|| format!("loading clock state {}", path.display()))?;
            let skipped = clock.load_state(&snapshot);
            if skipped > 0 {
                warn!(skipped, "save state has timers this simulation does not register");
            }
            info!(path = %path.display(), ticks = %clock.current_ticks(), "clock state restored");
        }

        let driver = ClockDriver::spawn(clock).context("starting clock thread")?;
        Ok(SimRobot { values, driver, sent: HashMap::new() })
    }

    pub fn values(&self) -> &SimValues {
        &self.values
    }

    /// Effective simulated ticks per second.
    pub fn effective_speed(&self) -> u32 {
        self.driver.effective_speed()
    }

    /// Messages for every value that changed since the last call.
    pub fn changed(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        for (op, value) in self.values.table() {
            let v = value.get();
            if self.sent.insert(op, v) != Some(v) {
                out.push(to_message(op, v));
            }
        }
        out
    }

    /// Forget what was sent so the next [`changed`](Self::changed) reports everything.
    pub fn resend_all(&mut self) {
        self.sent.clear();
    }

    /// Handle a console command. Returns `None` for text the simulator does
    /// not understand, otherwise a reply line.
    pub fn command(&self, line: &str) -> Option<String> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let reply = match words.as_slice() {
            ["set", "speed", l, r] => match (l.parse::<u32>(), r.parse::<u32>()) {
                (Ok(l), Ok(r)) if l <= MAX_SPEED && r <= MAX_SPEED => {
                    self.values.dest_speed_left.set(l);
                    self.values.dest_speed_right.set(r);
                    format!("speed {} {}", l, r)
                }
                _ => format!("speed must be 0..={}", MAX_SPEED),
            },
            ["set", "dir", "fwd"] => {
                self.values.motor_dirs.set(0);
                "dir fwd".to_string()
            }
            ["set", "dir", "bwd"] => {
                self.values.motor_dirs.set(DIR_LEFT_BWD | DIR_RIGHT_BWD);
                "dir bwd".to_string()
            }
            ["stop"] => {
                self.values.dest_speed_left.set(0);
                self.values.dest_speed_right.set(0);
                "stopped".to_string()
            }
            ["acs", "on"] | ["acs", "off"] => {
                self.values.acs_power.set((words[1] == "on") as u32);
                format!("acs {}", words[1])
            }
            ["clock", "speed", hz] => match hz.parse::<u64>() {
                Ok(hz) if hz > 0 => self.send_clock(ClockCommand::SetTargetSpeed(hz), format!("clock speed {}", hz)),
                _ => "clock speed must be a positive integer".to_string(),
            },
            ["clock", "cpu", usage] => match usage.parse::<CpuUsage>() {
                Ok(u) => self.send_clock(ClockCommand::SetCpuUsage(u), format!("clock cpu {:?}", u)),
                Err(e) => e,
            },
            ["clock"] => format!("clock {} ticks/s", self.effective_speed()),
            _ => return None,
        };
        Some(reply)
    }

    fn send_clock(&self, cmd: ClockCommand, reply: String) -> String {
        if self.driver.send(cmd) {
            reply
        } else {
            warn!("clock thread has exited, command dropped");
            CLOCK_STOPPED.to_string()
        }
    }

    /// Stop the clock thread and hand back the clock.
    pub fn stop(self) -> anyhow::Result<AvrClock> {
        Ok(self.driver.stop()?)
    }
}
