//! In-memory audio backend.
//!
//! Captured blocks are injected by the caller and played samples are
//! recorded, so sessions can run without sound hardware (tests, `--no-audio`).

use super::{AudioBackend, AudioBlock, AudioError, AudioFormat, BlockProducer, DeviceHandle, PlaybackSink};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockState {
    producer: Mutex<Option<BlockProducer>>,
    scripted: Mutex<Vec<AudioBlock>>,
    played: Mutex<Vec<Vec<i16>>>,
    opened: AtomicUsize,
    released: AtomicUsize,
    fail_capture: Mutex<Option<String>>,
}

#[derive(Clone, Default)]
pub struct MockAudioBackend {
    state: Arc<MockState>,
}

impl MockAudioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks delivered as soon as the next capture device opens.
    pub fn with_capture_blocks(self, blocks: Vec<AudioBlock>) -> Self {
        if let Ok(mut scripted) = self.state.scripted.lock() {
            *scripted = blocks;
        }
        self
    }

    /// Make `open_capture` fail, as if the microphone were missing.
    pub fn with_capture_failure(self, message: &str) -> Self {
        if let Ok(mut fail) = self.state.fail_capture.lock() {
            *fail = Some(message.to_string());
        }
        self
    }

    /// Feed a block through the open capture device. Returns `false` when no
    /// device is open or the queue has been closed.
    pub fn capture(&self, block: AudioBlock) -> bool {
        match self.state.producer.lock() {
            Ok(guard) => guard.as_ref().map(|p| p.push(block)).unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.state
            .producer
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Every payload written to playback, in write order.
    pub fn played(&self) -> Vec<Vec<i16>> {
        self.state
            .played
            .lock()
            .map(|played| played.clone())
            .unwrap_or_default()
    }

    /// Devices currently held open.
    pub fn open_devices(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst) - self.state.released.load(Ordering::SeqCst)
    }

    pub fn total_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }
}

impl AudioBackend for MockAudioBackend {
    fn open_capture(
        &self,
        _format: &AudioFormat,
        producer: BlockProducer,
    ) -> Result<DeviceHandle, AudioError> {
        if let Ok(fail) = self.state.fail_capture.lock() {
            if let Some(message) = fail.as_ref() {
                return Err(AudioError::Device(message.clone()));
            }
        }

        let scripted = self
            .state
            .scripted
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default();
        for block in scripted {
            producer.push(block);
        }

        if let Ok(mut slot) = self.state.producer.lock() {
            *slot = Some(producer);
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);

        let state = Arc::clone(&self.state);
        Ok(DeviceHandle::new("mock-capture", move || {
            if let Ok(mut slot) = state.producer.lock() {
                slot.take();
            }
            state.released.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn open_playback(&self, _format: &AudioFormat) -> Result<Box<dyn PlaybackSink>, AudioError> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPlayback {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockPlayback {
    state: Arc<MockState>,
}

impl PlaybackSink for MockPlayback {
    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        self.state
            .played
            .lock()
            .map_err(|_| AudioError::Closed)?
            .push(samples.to_vec());
        Ok(())
    }
}

impl Drop for MockPlayback {
    fn drop(&mut self) {
        self.state.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::OutboundQueue;

    #[test]
    fn test_capture_flows_into_queue() {
        let backend = MockAudioBackend::new().with_capture_blocks(vec![AudioBlock::new(vec![1])]);
        let (producer, consumer) = OutboundQueue::with_capacity(4).split();
        let handle = backend
            .open_capture(&AudioFormat::default(), producer)
            .unwrap();

        assert!(backend.capture(AudioBlock::new(vec![2])));
        assert_eq!(consumer.pop().unwrap().samples(), &[1]);
        assert_eq!(consumer.pop().unwrap().samples(), &[2]);

        handle.close();
        assert!(!backend.capture(AudioBlock::new(vec![3])));
        assert_eq!(backend.open_devices(), 0);
    }

    #[test]
    fn test_playback_records_writes() {
        let backend = MockAudioBackend::new();
        let mut sink = backend.open_playback(&AudioFormat::default()).unwrap();
        sink.write(&[1, 2]).unwrap();
        sink.write(&[3]).unwrap();
        assert_eq!(backend.open_devices(), 1);
        drop(sink);

        assert_eq!(backend.played(), vec![vec![1, 2], vec![3]]);
        assert_eq!(backend.open_devices(), 0);
    }

    #[test]
    fn test_capture_failure() {
        let backend = MockAudioBackend::new().with_capture_failure("no microphone");
        let (producer, _consumer) = OutboundQueue::with_capacity(4).split();
        let err = backend
            .open_capture(&AudioFormat::default(), producer)
            .unwrap_err();
        assert!(err.to_string().contains("no microphone"));
        assert_eq!(backend.total_opened(), 0);
    }
}
