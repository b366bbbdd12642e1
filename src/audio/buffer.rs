//! Lock-free packet queue between the capture thread and the sender task
//!
//! Single-producer single-consumer: the cpal callback pushes, the network
//! task pops. A full queue drops the newest packet rather than blocking
//! the audio thread.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::protocol::AudioPacket;

pub struct PacketQueue {
    queue: ArrayQueue<AudioPacket>,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Push a packet; returns false if the queue is full (overflow)
    pub fn push(&self, packet: AudioPacket) -> bool {
        match self.queue.push(packet) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop a packet; counts an underrun when empty
    pub fn pop(&self) -> Option<AudioPacket> {
        match self.queue.pop() {
            Some(packet) => Some(packet),
            None => {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Pop everything currently queued
    pub fn drain(&self) -> Vec<AudioPacket> {
        let mut packets = Vec::with_capacity(self.queue.len());
        while let Some(packet) = self.queue.pop() {
            packets.push(packet);
        }
        packets
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// Fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.len() as f32 / self.capacity() as f32
    }
}

/// Thread-safe handle to a packet queue
pub type SharedPacketQueue = Arc<PacketQueue>;

pub fn create_shared_queue(capacity: usize) -> SharedPacketQueue {
    Arc::new(PacketQueue::new(capacity))
}
