// crates/cutline-media/src/filter/audio_effect.rs
//
// AudioEffectFilter: the per-track / per-composer effects chain, built on a
// codec-library filter graph.
//
//   volume → compressor → gate → equalizer bands → limiter → pan
//
// Parameter groups with identity values contribute no graph node. Tunable
// parameters on live nodes update through `avfilter_graph_send_command`
// without a rebuild; structural changes (enabling a group, pan, channel or
// rate change) mark the graph dirty and the next `apply` rebuilds it with
// the current parameters as initial arguments — so a rebuilt graph sounds
// identical to a commanded one.

use std::ffi::CString;

use anyhow::{anyhow, Context as _};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::filter;
use ffmpeg::util::frame::audio::Audio as AvAudio;

use cutline_core::SampleBlock;

use crate::error::{Error, Result};
use crate::ffutil;
use crate::reader::AudioOutputSpec;

// ── Parameter groups ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompressorParams {
    pub enabled: bool,
    pub threshold_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub makeup_db: f32,
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_db: -18.0,
            ratio: 2.0,
            attack_ms: 20.0,
            release_ms: 250.0,
            makeup_db: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GateParams {
    pub enabled: bool,
    pub threshold_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
}

impl Default for GateParams {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_db: -48.0,
            ratio: 2.0,
            attack_ms: 20.0,
            release_ms: 250.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LimiterParams {
    pub enabled: bool,
    pub limit_db: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
}

impl Default for LimiterParams {
    fn default() -> Self {
        Self { enabled: false, limit_db: -1.0, attack_ms: 5.0, release_ms: 50.0 }
    }
}

/// Ten octave bands, 31.25 Hz … 16 kHz, gains in dB.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct EqualizerParams {
    pub enabled: bool,
    pub gains_db: [f32; 10],
}

pub(crate) const EQ_BAND_HZ: [u32; 10] =
    [31, 62, 125, 250, 500, 1000, 2000, 4000, 8000, 16000];

/// The full chain state. `volume` is linear gain; `pan` ∈ [-1, 1].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AudioEffectParams {
    pub volume: f32,
    pub muted: bool,
    pub pan: f32,
    pub compressor: CompressorParams,
    pub gate: GateParams,
    pub limiter: LimiterParams,
    pub equalizer: EqualizerParams,
}

impl Default for AudioEffectParams {
    fn default() -> Self {
        Self {
            volume: 1.0,
            muted: false,
            pan: 0.0,
            compressor: CompressorParams::default(),
            gate: GateParams::default(),
            limiter: LimiterParams::default(),
            equalizer: EqualizerParams::default(),
        }
    }
}

fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// The filter-graph chain string for `params`. The `volume` node is always
/// present (it carries mute); other groups appear only when enabled.
pub(crate) fn build_graph_spec(params: &AudioEffectParams) -> String {
    let mut parts = Vec::new();

    let vol = if params.muted { 0.0 } else { params.volume };
    parts.push(format!("volume@vol=volume={vol}:precision=float:eval=frame"));

    if params.compressor.enabled {
        let c = &params.compressor;
        parts.push(format!(
            "acompressor@comp=threshold={}:ratio={}:attack={}:release={}:makeup={}",
            db_to_linear(c.threshold_db).clamp(0.000976563, 1.0),
            c.ratio.clamp(1.0, 20.0),
            c.attack_ms.max(0.01),
            c.release_ms.max(0.01),
            db_to_linear(c.makeup_db).clamp(1.0, 64.0),
        ));
    }

    if params.gate.enabled {
        let g = &params.gate;
        parts.push(format!(
            "agate@gate=threshold={}:ratio={}:attack={}:release={}",
            db_to_linear(g.threshold_db).clamp(0.0, 1.0),
            g.ratio.clamp(1.0, 9000.0),
            g.attack_ms.max(0.01),
            g.release_ms.max(0.01),
        ));
    }

    if params.equalizer.enabled {
        for (i, (&gain, &freq)) in params
            .equalizer
            .gains_db
            .iter()
            .zip(EQ_BAND_HZ.iter())
            .enumerate()
        {
            parts.push(format!("equalizer@eq{i}=f={freq}:t=o:w=1:g={gain}"));
        }
    }

    if params.limiter.enabled {
        let l = &params.limiter;
        parts.push(format!(
            "alimiter@limit=limit={}:attack={}:release={}",
            db_to_linear(l.limit_db).clamp(0.0625, 1.0),
            l.attack_ms.max(0.1),
            l.release_ms.max(1.0),
        ));
    }

    if params.pan.abs() > f32::EPSILON {
        // Linear pan law: attenuate the side being panned away from.
        let left = (1.0 - params.pan).clamp(0.0, 1.0);
        let right = (1.0 + params.pan).clamp(0.0, 1.0);
        parts.push(format!("pan@pan=stereo|c0={left}*c0|c1={right}*c1"));
    }

    parts.join(",")
}

// ── Filter ───────────────────────────────────────────────────────────────────

pub struct AudioEffectFilter {
    spec: AudioOutputSpec,
    params: AudioEffectParams,
    graph: Option<filter::Graph>,
    dirty: bool,
    next_pts: i64,
}

impl AudioEffectFilter {
    pub fn new(spec: AudioOutputSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            spec,
            params: AudioEffectParams::default(),
            graph: None,
            dirty: true,
            next_pts: 0,
        })
    }

    pub fn params(&self) -> &AudioEffectParams {
        &self.params
    }

    /// Replace the whole parameter set (rebuilds on next apply).
    pub fn set_params(&mut self, params: AudioEffectParams) -> Result<()> {
        if params.volume < 0.0 {
            return Err(Error::invalid("volume must be >= 0"));
        }
        if !(-1.0..=1.0).contains(&params.pan) {
            return Err(Error::invalid("pan must be within [-1, 1]"));
        }
        self.params = params;
        self.dirty = true;
        Ok(())
    }

    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        if volume < 0.0 {
            return Err(Error::invalid("volume must be >= 0"));
        }
        self.params.volume = volume;
        if !self.params.muted {
            self.command("vol", "volume", &format!("{volume}"));
        }
        Ok(())
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.params.muted = muted;
        let v = if muted { 0.0 } else { self.params.volume };
        self.command("vol", "volume", &format!("{v}"));
    }

    pub fn set_pan(&mut self, pan: f32) -> Result<()> {
        if !(-1.0..=1.0).contains(&pan) {
            return Err(Error::invalid("pan must be within [-1, 1]"));
        }
        // pan has no runtime commands — structural change.
        self.params.pan = pan;
        self.dirty = true;
        Ok(())
    }

    pub fn set_compressor(&mut self, c: CompressorParams) {
        let structural = c.enabled != self.params.compressor.enabled;
        self.params.compressor = c;
        self.dirty |= structural || c.enabled; // acompressor has no commands
    }

    pub fn set_gate(&mut self, g: GateParams) {
        let structural = g.enabled != self.params.gate.enabled;
        self.params.gate = g;
        self.dirty |= structural || g.enabled;
    }

    pub fn set_limiter(&mut self, l: LimiterParams) {
        let structural = l.enabled != self.params.limiter.enabled;
        self.params.limiter = l;
        self.dirty |= structural || l.enabled;
    }

    pub fn set_equalizer_band(&mut self, band: usize, gain_db: f32) -> Result<()> {
        if band >= EQ_BAND_HZ.len() {
            return Err(Error::invalid(format!("equalizer band {band} out of range")));
        }
        self.params.equalizer.gains_db[band] = gain_db;
        if self.params.equalizer.enabled {
            self.command(&format!("eq{band}"), "g", &format!("{gain_db}"));
        }
        Ok(())
    }

    pub fn set_equalizer(&mut self, eq: EqualizerParams) {
        let structural = eq.enabled != self.params.equalizer.enabled;
        self.params.equalizer = eq;
        if structural {
            self.dirty = true;
        } else if eq.enabled {
            for (i, g) in eq.gains_db.iter().enumerate() {
                self.command(&format!("eq{i}"), "g", &format!("{g}"));
            }
        }
    }

    /// Output format change (track or composer reconfigure): rebuild with
    /// the current parameters as initial arguments.
    pub fn reconfigure(&mut self, spec: AudioOutputSpec) -> Result<()> {
        spec.validate()?;
        self.spec = spec;
        self.dirty = true;
        Ok(())
    }

    /// Run one block through the chain. The output carries the input's
    /// timestamp; its length may briefly differ from the input while a
    /// newly built graph primes its internal delay lines.
    pub fn apply(&mut self, block: &SampleBlock) -> Result<SampleBlock> {
        if block.is_empty() {
            return Ok(block.clone());
        }
        if self.dirty || self.graph.is_none() {
            self.rebuild()?;
        }

        let frame = ffutil::block_to_flt_frame(block, self.next_pts);
        self.next_pts += block.sample_count() as i64;

        let graph = self.graph.as_mut().expect("rebuilt above");
        graph
            .get("in")
            .ok_or_else(|| Error::Worker("effect graph lost its source".into()))?
            .source()
            .add(&frame)
            .map_err(|e| crate::error::ff("av_buffersrc_add_frame", e))?;

        let mut out = SampleBlock {
            channels: self.spec.channels,
            sample_rate: self.spec.sample_rate,
            data: Vec::with_capacity(block.data.len()),
            timestamp: block.timestamp,
        };
        let mut sink_frame = AvAudio::empty();
        while graph
            .get("out")
            .expect("sink exists")
            .sink()
            .frame(&mut sink_frame)
            .is_ok()
        {
            let chunk = ffutil::flt_frame_to_block(&sink_frame, self.spec.sample_rate, 0.0)
                .map_err(|e| Error::Worker(format!("effect sink read: {e:#}")))?;
            out.data.extend_from_slice(&chunk.data);
            sink_frame = AvAudio::empty();
        }
        Ok(out)
    }

    fn rebuild(&mut self) -> Result<()> {
        let built = build_graph(&self.spec, &self.params)
            .map_err(|e| Error::Worker(format!("build audio effect graph: {e:#}")))?;
        self.graph = Some(built);
        self.dirty = false;
        log::debug!(
            "[afx] graph rebuilt: {} @ {} Hz x{}",
            build_graph_spec(&self.params),
            self.spec.sample_rate,
            self.spec.channels
        );
        Ok(())
    }

    /// Live parameter update; unsupported commands fall back to a rebuild.
    fn command(&mut self, target: &str, cmd: &str, arg: &str) {
        let Some(graph) = self.graph.as_mut() else {
            self.dirty = true;
            return;
        };
        let (Ok(t), Ok(c), Ok(a)) = (
            CString::new(target),
            CString::new(cmd),
            CString::new(arg),
        ) else {
            self.dirty = true;
            return;
        };
        let rc = unsafe {
            ffmpeg::ffi::avfilter_graph_send_command(
                graph.as_mut_ptr(),
                t.as_ptr(),
                c.as_ptr(),
                a.as_ptr(),
                std::ptr::null_mut(),
                0,
                0,
            )
        };
        if rc < 0 {
            log::debug!("[afx] send_command {target}.{cmd}={arg} unsupported (rc={rc}); rebuilding");
            self.dirty = true;
        }
    }
}

fn build_graph(spec: &AudioOutputSpec, params: &AudioEffectParams) -> anyhow::Result<filter::Graph> {
    let layout = if spec.channels == 1 { "mono" } else { "stereo" };
    let rate = spec.sample_rate;

    let mut graph = filter::Graph::new();
    let src_args = format!(
        "time_base=1/{rate}:sample_rate={rate}:sample_fmt=flt:channel_layout={layout}"
    );
    graph
        .add(
            &filter::find("abuffer").ok_or_else(|| anyhow!("abuffer filter missing"))?,
            "in",
            &src_args,
        )
        .context("create abuffer")?;
    graph
        .add(
            &filter::find("abuffersink").ok_or_else(|| anyhow!("abuffersink filter missing"))?,
            "out",
            "",
        )
        .context("create abuffersink")?;

    let chain = build_graph_spec(params);
    let full = format!(
        "{chain},aformat=sample_fmts=flt:sample_rates={rate}:channel_layouts={layout}"
    );
    graph
        .output("in", 0)
        .context("link source")?
        .input("out", 0)
        .context("link sink")?
        .parse(&full)
        .with_context(|| format!("parse graph '{full}'"))?;
    graph.validate().context("validate graph")?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_spec_is_volume_only() {
        let spec = build_graph_spec(&AudioEffectParams::default());
        assert_eq!(spec, "volume@vol=volume=1:precision=float:eval=frame");
    }

    #[test]
    fn mute_zeroes_the_volume_node() {
        let params = AudioEffectParams { muted: true, ..Default::default() };
        assert!(build_graph_spec(&params).starts_with("volume@vol=volume=0:"));
    }

    #[test]
    fn enabled_groups_appear_in_chain_order() {
        let params = AudioEffectParams {
            compressor: CompressorParams { enabled: true, ..Default::default() },
            limiter: LimiterParams { enabled: true, ..Default::default() },
            pan: 0.5,
            ..Default::default()
        };
        let spec = build_graph_spec(&params);
        let vol = spec.find("volume@vol").unwrap();
        let comp = spec.find("acompressor@comp").unwrap();
        let lim = spec.find("alimiter@limit").unwrap();
        let pan = spec.find("pan@pan").unwrap();
        assert!(vol < comp && comp < lim && lim < pan);
        assert!(!spec.contains("agate"));
    }

    #[test]
    fn equalizer_emits_one_node_per_band() {
        let params = AudioEffectParams {
            equalizer: EqualizerParams { enabled: true, gains_db: [3.0; 10] },
            ..Default::default()
        };
        let spec = build_graph_spec(&params);
        for i in 0..10 {
            assert!(spec.contains(&format!("equalizer@eq{i}=")), "missing band {i}");
        }
    }

    #[test]
    fn pan_attenuates_the_far_side() {
        let params = AudioEffectParams { pan: 1.0, ..Default::default() };
        let spec = build_graph_spec(&params);
        assert!(spec.contains("c0=0*c0"));
        assert!(spec.contains("c1=1*c1"));
    }

    #[test]
    fn param_validation() {
        let spec = AudioOutputSpec { channels: 2, sample_rate: 44100 };
        let mut f = AudioEffectFilter::new(spec).unwrap();
        assert!(f.set_volume(-0.5).is_err());
        assert!(f.set_pan(2.0).is_err());
        assert!(f.set_equalizer_band(10, 0.0).is_err());
        assert!(f.set_equalizer_band(9, -6.0).is_ok());
    }

    #[test]
    fn db_conversion_reference_points() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_linear(-6.0) - 0.5012).abs() < 1e-3);
        assert!((db_to_linear(-20.0) - 0.1).abs() < 1e-6);
    }
}
