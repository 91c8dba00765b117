//! Audio fan-out (spec.md §4.8, §5): one dedicated thread reads frames from
//! the audio source, post-processes them, and dispatches a copy to every
//! registered output's audio encoder. Mirrors the compositor's and the
//! encoder module's dedicated-thread-plus-channel shape.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::frame::Frame;
use crate::output::Output;
use crate::source::FrameSource;

/// `{with_audio, with_video, audio_output_mode}` (spec.md §4.8). Per
/// spec.md §9 open question 2, the source material never resolves a
/// runtime trigger for switching modes, so both variants drive the pump off
/// the source's blocking `read_frame` (PUSH); `Pull` is accepted and
/// recorded for parity with the source format but does not change the
/// pump's behavior.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AudioOutputMode {
    Push,
    Pull,
}

/// Post-processing applied to every frame before fan-out (spec.md §4.8:
/// "post-processed (effects pipeline)"). Concrete audio effects are an
/// external collaborator outside this crate's scope (spec.md §1); the
/// default [`IdentityEffectsChain`] passes frames through unchanged.
pub trait AudioEffectsChain: Send + Sync {
    fn process(&self, frame: Frame) -> Frame;
}

pub struct IdentityEffectsChain;

impl AudioEffectsChain for IdentityEffectsChain {
    fn process(&self, frame: Frame) -> Frame {
        frame
    }
}

enum PumpCmd {
    SetSource(Option<Arc<dyn FrameSource>>),
    Register(u64, Arc<Output>),
    Unregister(u64),
    Stop,
}

pub struct AudioPump {
    tx: crossbeam_channel::Sender<PumpCmd>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
    mode: AudioOutputMode,
}

impl AudioPump {
    pub fn new(mode: AudioOutputMode, effects: Arc<dyn AudioEffectsChain>) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<PumpCmd>();
        let join = std::thread::Builder::new()
            .name("castpipe-audio-pump".into())
            .spawn(move || pump_thread_main(rx, effects))
            .expect("spawn audio pump thread");
        Arc::new(AudioPump { tx, join: Mutex::new(Some(join)), mode })
    }

    pub fn mode(&self) -> AudioOutputMode {
        self.mode
    }

    pub fn set_source(&self, source: Option<Arc<dyn FrameSource>>) {
        let _ = self.tx.send(PumpCmd::SetSource(source));
    }

    pub fn register_output(&self, output_id: u64, output: Arc<Output>) {
        let _ = self.tx.send(PumpCmd::Register(output_id, output));
    }

    pub fn unregister_output(&self, output_id: u64) {
        let _ = self.tx.send(PumpCmd::Unregister(output_id));
    }

    pub fn release(&self) {
        let _ = self.tx.send(PumpCmd::Stop);
        if let Some(j) = self.join.lock().take() {
            let _ = j.join();
        }
    }
}

fn pump_thread_main(rx: crossbeam_channel::Receiver<PumpCmd>, effects: Arc<dyn AudioEffectsChain>) {
    let mut source: Option<Arc<dyn FrameSource>> = None;
    let mut outputs: HashMap<u64, Arc<Output>> = HashMap::new();

    loop {
        match rx.try_recv() {
            Ok(PumpCmd::Stop) => return,
            Ok(PumpCmd::SetSource(s)) => source = s,
            Ok(PumpCmd::Register(id, output)) => {
                outputs.insert(id, output);
            }
            Ok(PumpCmd::Unregister(id)) => {
                outputs.remove(&id);
            }
            Err(crossbeam_channel::TryRecvError::Disconnected) => return,
            Err(crossbeam_channel::TryRecvError::Empty) => {}
        }

        let Some(src) = source.as_ref() else {
            // No source bound yet; block on the next command instead of
            // busy-spinning.
            match rx.recv_timeout(Duration::from_millis(20)) {
                Ok(PumpCmd::Stop) => return,
                Ok(PumpCmd::SetSource(s)) => source = s,
                Ok(PumpCmd::Register(id, output)) => {
                    outputs.insert(id, output);
                }
                Ok(PumpCmd::Unregister(id)) => {
                    outputs.remove(&id);
                }
                Err(_) => {}
            }
            continue;
        };

        match src.read_frame() {
            Ok(frame) => {
                let processed = effects.process(frame);
                for output in outputs.values() {
                    output.push_audio_frame(processed.clone());
                }
            }
            Err(_) => {
                // Not streaming yet, or a transient read failure; avoid a
                // busy loop while the source catches up.
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }
}
