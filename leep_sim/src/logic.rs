//! Derived-data logic of the simulator.
//!
//! A [`SimLogic`] intercepts every register write. The plain variant only
//! stores the value; the others emulate firmware side effects so clients
//! can exercise their acquisition paths without hardware.
//!
//! # Variants
//!
//! - [`PlainLogic`] - store only (`-L none`)
//! - [`WaveformLogic`] - reset-bit triggered buffer fills (`-L hires`)
//! - [`CircleBufferLogic`] - circle buffer flip with sine data (`-L rfs`)

use crate::error::{SimError, SimResult};
use crate::image::SimImage;
use leep_common::config::{BitRef, WaveformRuleConfig};
use std::f64::consts::PI;
use tracing::debug;

/// Side effects applied when the simulator handles a write.
pub trait SimLogic: Send {
    /// Logic name for logs.
    fn name(&self) -> &'static str;

    /// Handle a write of `value` (already masked) to word `offset` of
    /// register `index`.
    fn reg_write(&mut self, image: &mut SimImage, index: usize, offset: usize, value: u32) {
        image.store(index, offset, value);
    }
}

/// Selects a logic variant on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogicKind {
    /// Plain register store.
    #[default]
    None,
    /// Circle buffer logic.
    Rfs,
    /// Waveform rules.
    Hires,
}

/// Build the logic for `kind` against `image`.
///
/// `rules` replaces the built-in waveform presets when non-empty.
pub fn build_logic(
    kind: LogicKind,
    image: &SimImage,
    rules: &[WaveformRuleConfig],
) -> SimResult<Box<dyn SimLogic>> {
    Ok(match kind {
        LogicKind::None => Box::new(PlainLogic),
        LogicKind::Rfs => Box::new(CircleBufferLogic::new(image)?),
        LogicKind::Hires if rules.is_empty() => Box::new(WaveformLogic::new(&hires_presets(), image)?),
        LogicKind::Hires => Box::new(WaveformLogic::new(rules, image)?),
    })
}

/// Store-only logic.
#[derive(Debug, Default)]
pub struct PlainLogic;

impl SimLogic for PlainLogic {
    fn name(&self) -> &'static str {
        "none"
    }
}

// ─── Waveform rules ─────────────────────────────────────────────────

/// Built-in rules of the high resolution firmware.
pub fn hires_presets() -> Vec<WaveformRuleConfig> {
    fn rule(
        name: &str,
        reset: (&str, u32),
        status: (&str, u32),
        valid: u32,
        mask: Option<&str>,
    ) -> WaveformRuleConfig {
        WaveformRuleConfig {
            name: name.to_string(),
            reset: BitRef {
                register: reset.0.to_string(),
                bit: reset.1,
            },
            status: BitRef {
                register: status.0.to_string(),
                bit: status.1,
            },
            buffer: name.to_string(),
            valid,
            mask: mask.map(str::to_string),
        }
    }

    vec![
        WaveformRuleConfig {
            buffer: "banyan_data".to_string(),
            ..rule("banyan", ("banyan_reset", 0), ("banyan_status", 30), 0xfff, None)
        },
        rule("trace_odata", ("trace_flip", 0), ("trace_status1", 30), 0x00ff_ffff, Some("keep")),
        rule("decay_data", ("decay_reset", 0), ("decay_ro_enable", 0), 0xffff, Some("decaykeep")),
        rule("abuf_data", ("abuf_reset", 0), ("abuf_ro_enable", 30), 0xffff, None),
        rule("adcbuf_dataB", ("adcbuf_reset", 0), ("adcbuf_full", 0), 0xff, None),
    ]
}

/// A rule resolved against the image.
#[derive(Debug, Clone)]
struct WaveformRule {
    name: String,
    reset: (usize, u32),
    status: (usize, u32),
    buffer: usize,
    valid: u32,
    mask: Option<usize>,
}

impl WaveformRule {
    fn resolve(config: &WaveformRuleConfig, image: &SimImage) -> SimResult<Self> {
        let bit = |b: &BitRef| -> SimResult<(usize, u32)> {
            if b.bit >= 32 {
                return Err(SimError::BadRegister {
                    name: b.register.clone(),
                    reason: format!("bit {} out of range", b.bit),
                });
            }
            Ok((image.index(&b.register)?, b.bit))
        };
        Ok(Self {
            name: config.name.clone(),
            reset: bit(&config.reset)?,
            status: bit(&config.status)?,
            buffer: image.index(&config.buffer)?,
            valid: config.valid,
            mask: config.mask.as_deref().map(|m| image.index(m)).transpose()?,
        })
    }

    /// Run the rule if its reset bit is set; returns true when it fired.
    fn process(&self, image: &mut SimImage, seed: u32) -> bool {
        let (reset, reset_bit) = self.reset;
        if !image.reg(reset).bit(reset_bit) {
            return false;
        }
        image.reg_mut(reset).storage[0] &= !(1 << reset_bit);

        let selected = match self.mask {
            Some(mask) => image.reg(mask).storage[0],
            None => self.valid,
        };
        fill_waveform(&mut image.reg_mut(self.buffer).storage, selected, seed);

        let (status, status_bit) = self.status;
        image.reg_mut(status).storage[0] |= 1 << status_bit;
        debug!("Waveform {} generated (seed {})", self.name, seed);
        true
    }
}

/// Fill `buffer` with interleaved samples of the `selected` channels.
///
/// Sample `t` of channel `sig` is `seed + sig*10 ± 5t` (minus for odd
/// channels), in wrapping arithmetic.
pub fn fill_waveform(buffer: &mut [u32], selected: u32, seed: u32) {
    if selected == 0 {
        return;
    }
    let mut idx = 0;
    let mut t: u32 = 0;
    while idx < buffer.len() {
        for sig in 0..32u32 {
            if idx >= buffer.len() {
                break;
            }
            if selected & (1 << sig) == 0 {
                continue;
            }
            let step = t.wrapping_mul(5);
            let step = if sig & 1 == 1 { step.wrapping_neg() } else { step };
            buffer[idx] = seed.wrapping_add(sig * 10).wrapping_add(step);
            idx += 1;
        }
        t = t.wrapping_add(1);
    }
}

/// Reset-bit triggered waveform generation.
///
/// Every rule is evaluated after every write, so one frame may fire
/// several rules. The seed increments once per fired rule.
#[derive(Debug)]
pub struct WaveformLogic {
    rules: Vec<WaveformRule>,
    seed: u32,
}

impl WaveformLogic {
    /// Resolve `rules` against the image.
    ///
    /// # Errors
    /// `SimError::UnknownRegister` if a rule names a missing register.
    pub fn new(rules: &[WaveformRuleConfig], image: &SimImage) -> SimResult<Self> {
        let rules = rules
            .iter()
            .map(|r| WaveformRule::resolve(r, image))
            .collect::<SimResult<Vec<_>>>()?;
        Ok(Self { rules, seed: 0 })
    }

    /// Seed the next fired rule will use.
    pub fn seed(&self) -> u32 {
        self.seed
    }
}

impl SimLogic for WaveformLogic {
    fn name(&self) -> &'static str {
        "hires"
    }

    fn reg_write(&mut self, image: &mut SimImage, index: usize, offset: usize, value: u32) {
        image.store(index, offset, value);
        for rule in &self.rules {
            if rule.process(image, self.seed) {
                self.seed = self.seed.wrapping_add(1);
            }
        }
    }
}

// ─── Circle buffer ──────────────────────────────────────────────────

const SHELLS: usize = 2;
const AMPLITUDE: f64 = 10000.0;
const SLOW_DATA_MIN_WORDS: usize = 43;

#[derive(Debug, Clone, Copy)]
struct Shell {
    chan_keep: usize,
    tag: usize,
    circle_data: usize,
    slow_data: usize,
}

/// Circle buffer acquisition of the RF station firmware.
///
/// Writing a non-zero value to `circle_buf_flip` acquires a buffer for
/// each selected shell (bit i selects `shell_i_*`), then raises the
/// matching bits of `llrf_circle_ready`.
#[derive(Debug)]
pub struct CircleBufferLogic {
    flip: usize,
    ready: usize,
    shells: [Shell; SHELLS],
    phase: f64,
    circle_count: u32,
}

impl CircleBufferLogic {
    /// Resolve the circle buffer registers.
    pub fn new(image: &SimImage) -> SimResult<Self> {
        let shell = |i: usize| -> SimResult<Shell> {
            let s = Shell {
                chan_keep: image.index(&format!("shell_{i}_dsp_chan_keep"))?,
                tag: image.index(&format!("shell_{i}_dsp_tag"))?,
                circle_data: image.index(&format!("shell_{i}_circle_data"))?,
                slow_data: image.index(&format!("shell_{i}_slow_data"))?,
            };
            let slow = image.reg(s.slow_data);
            if slow.storage.len() < SLOW_DATA_MIN_WORDS {
                return Err(SimError::BadRegister {
                    name: slow.name.clone(),
                    reason: "shell_X_slow_data register size too small".to_string(),
                });
            }
            Ok(s)
        };
        Ok(Self {
            flip: image.index("circle_buf_flip")?,
            ready: image.index("llrf_circle_ready")?,
            shells: [shell(0)?, shell(1)?],
            phase: 0.0,
            circle_count: 0,
        })
    }

    fn acquire(&mut self, image: &mut SimImage, instance: usize) {
        let shell = self.shells[instance];
        let mask = image.reg(shell.chan_keep).storage[0] & 0xfff;
        if mask == 0 {
            return;
        }
        let tag = image.reg(shell.tag).storage[0] & 0xffff;

        let arr = &mut image.reg_mut(shell.circle_data).storage;
        let n = arr.len();
        if n < 12 {
            return;
        }
        // five periods when all channels are selected
        let t_inc = 2.0 * PI * 5.0 / (n / 12) as f64;
        let (mut min, mut max) = (0i32, 0i32);
        let mut i = 0;
        let mut t = 0.0f64;

        while i < n {
            let modulation = (1.0 - t * 0.5 / (2.0 * PI * 5.0)).abs();
            let adc = (AMPLITUDE * modulation * t.sin()) as i32;
            if adc < min || t == 0.0 {
                min = adc;
            }
            if adc > max || t == 0.0 {
                max = adc;
            }

            let mut pha = self.phase;
            for ch in (0..12).step_by(2) {
                let angle = t + pha.to_radians();
                if mask & (0x800 >> ch) != 0 && i < n {
                    arr[i] = (AMPLITUDE * modulation * angle.sin()) as i32 as u32;
                    i += 1;
                }
                if mask & (0x800 >> (ch + 1)) != 0 && i < n {
                    arr[i] = (AMPLITUDE * modulation * angle.cos()) as i32 as u32;
                    i += 1;
                }
                pha += 10.0;
            }
            t += t_inc;
        }

        let count = self.circle_count;
        let slow = &mut image.reg_mut(shell.slow_data).storage;
        slow.fill(0);
        slow[17] = (count >> 8) & 0xff;
        slow[18] = count & 0xff;
        for base in (21..=31).step_by(4) {
            slow[base] = ((min >> 8) & 0xff) as u32;
            slow[base + 1] = (min & 0xff) as u32;
            slow[base + 2] = ((max >> 8) & 0xff) as u32;
            slow[base + 3] = (max & 0xff) as u32;
        }
        slow[33] = tag;
        slow[34] = tag;
        self.circle_count = self.circle_count.wrapping_add(1);
    }
}

impl SimLogic for CircleBufferLogic {
    fn name(&self) -> &'static str {
        "rfs"
    }

    fn reg_write(&mut self, image: &mut SimImage, index: usize, offset: usize, value: u32) {
        let mut value = value;
        if index == self.flip && offset == 0 && value != 0 {
            value &= 3;
            image.reg_mut(self.ready).storage[0] &= !value;
            for instance in 0..SHELLS {
                if value & (1 << instance) != 0 {
                    self.acquire(image, instance);
                }
            }
            image.reg_mut(self.ready).storage[0] |= value;
            self.phase = (self.phase + 5.0) % 360.0;
        }
        image.store(index, offset, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::SimRegister;

    fn rule(mask: Option<&str>) -> WaveformRuleConfig {
        WaveformRuleConfig {
            name: "cap".to_string(),
            reset: BitRef {
                register: "cap_reset".to_string(),
                bit: 0,
            },
            status: BitRef {
                register: "cap_status".to_string(),
                bit: 30,
            },
            buffer: "cap_data".to_string(),
            valid: 0b1011,
            mask: mask.map(str::to_string),
        }
    }

    fn capture_image() -> SimImage {
        let mut image = SimImage::new();
        image.add(SimRegister::new("cap_reset", 0x10, 1, u32::MAX)).unwrap();
        image.add(SimRegister::new("cap_status", 0x11, 1, u32::MAX)).unwrap();
        image.add(SimRegister::new("cap_keep", 0x12, 1, u32::MAX)).unwrap();
        image.add(SimRegister::new("cap_data", 0x100, 9, u32::MAX)).unwrap();
        image
    }

    #[test]
    fn test_fill_waveform_formula() {
        let mut buf = [0u32; 7];
        fill_waveform(&mut buf, 0b1011, 100);
        // t=0: sig 0, 1, 3; t=1: sig 0, 1, 3; t=2: sig 0
        assert_eq!(buf, [100, 110, 130, 105, 105, 125, 110]);
    }

    #[test]
    fn test_fill_waveform_wraps() {
        let mut buf = [0u32; 4];
        fill_waveform(&mut buf, 0b10, 0);
        assert_eq!(buf, [10, 5, 0, 0u32.wrapping_sub(5)]);
    }

    #[test]
    fn test_fill_waveform_no_channels() {
        let mut buf = [7u32; 3];
        fill_waveform(&mut buf, 0, 1);
        assert_eq!(buf, [7, 7, 7]);
    }

    #[test]
    fn test_waveform_rule_fires_on_reset_bit() {
        let mut image = capture_image();
        let mut logic = WaveformLogic::new(&[rule(None)], &image).unwrap();
        let reset = image.index("cap_reset").unwrap();

        // writes without the reset bit do nothing
        logic.reg_write(&mut image, reset, 0, 2);
        assert!(!image.get("cap_status").unwrap().bit(30));
        assert_eq!(logic.seed(), 0);

        logic.reg_write(&mut image, reset, 0, 3);
        assert_eq!(image.get("cap_reset").unwrap().storage[0], 2);
        assert!(image.get("cap_status").unwrap().bit(30));
        assert_eq!(
            image.get("cap_data").unwrap().storage,
            vec![0, 10, 30, 5, 5, 25, 10, 0, 20]
        );
        assert_eq!(logic.seed(), 1);
    }

    #[test]
    fn test_waveform_mask_register_overrides_valid() {
        let mut image = capture_image();
        let mut logic = WaveformLogic::new(&[rule(Some("cap_keep"))], &image).unwrap();
        let keep = image.index("cap_keep").unwrap();
        let reset = image.index("cap_reset").unwrap();

        logic.reg_write(&mut image, keep, 0, 0b100);
        logic.reg_write(&mut image, reset, 0, 1);
        assert_eq!(
            image.get("cap_data").unwrap().storage,
            vec![20, 25, 30, 35, 40, 45, 50, 55, 60]
        );
    }

    #[test]
    fn test_waveform_unknown_register() {
        let image = SimImage::new();
        assert!(matches!(
            WaveformLogic::new(&[rule(None)], &image),
            Err(SimError::UnknownRegister(_))
        ));
    }

    #[test]
    fn test_hires_presets_need_registers() {
        let image = SimImage::new();
        assert!(build_logic(LogicKind::Hires, &image, &[]).is_err());
        assert!(build_logic(LogicKind::None, &image, &[]).is_ok());
        assert_eq!(hires_presets()[0].buffer, "banyan_data");
        assert_eq!(hires_presets()[1].mask.as_deref(), Some("keep"));
    }

    fn rfs_image() -> SimImage {
        let mut image = SimImage::new();
        image.add(SimRegister::new("circle_buf_flip", 0x10, 1, 0x3)).unwrap();
        image.add(SimRegister::new("llrf_circle_ready", 0x11, 1, 0x3)).unwrap();
        for i in 0..2u32 {
            let base = 0x1000 * (i + 1);
            image.add(SimRegister::new(format!("shell_{i}_dsp_chan_keep"), base, 1, 0xfff)).unwrap();
            image.add(SimRegister::new(format!("shell_{i}_dsp_tag"), base + 1, 1, 0xffff)).unwrap();
            image.add(SimRegister::new(format!("shell_{i}_slow_data"), base + 0x40, 64, 0xff)).unwrap();
            image.add(SimRegister::new(format!("shell_{i}_circle_data"), base + 0x100, 240, u32::MAX)).unwrap();
        }
        image
    }

    #[test]
    fn test_circle_buffer_flip() {
        let mut image = rfs_image();
        let mut logic = CircleBufferLogic::new(&image).unwrap();
        image.get_mut("shell_0_dsp_chan_keep").unwrap().storage[0] = 0xc00;
        image.get_mut("shell_0_dsp_tag").unwrap().storage[0] = 0x1_0042;
        let flip = image.index("circle_buf_flip").unwrap();

        logic.reg_write(&mut image, flip, 0, 0x5);

        assert_eq!(image.get("circle_buf_flip").unwrap().storage[0], 1);
        assert_eq!(image.get("llrf_circle_ready").unwrap().storage[0], 1);

        let data = &image.get("shell_0_circle_data").unwrap().storage;
        // first I/Q pair at t=0, phase 0: sin(0)=0, cos(0)=amplitude
        assert_eq!(data[0], 0);
        assert_eq!(data[1], 10000);

        let slow = &image.get("shell_0_slow_data").unwrap().storage;
        assert_eq!(slow[33], 0x42);
        assert_eq!(slow[34], 0x42);
        assert_eq!(slow[17], 0);

        // shell 1 was not selected
        assert!(image.get("shell_1_circle_data").unwrap().storage.iter().all(|&w| w == 0));
    }

    #[test]
    fn test_circle_buffer_requires_slow_data_size() {
        let mut image = rfs_image();
        image.get_mut("shell_1_slow_data").unwrap().storage.truncate(10);
        assert!(matches!(
            CircleBufferLogic::new(&image),
            Err(SimError::BadRegister { .. })
        ));
    }
}
