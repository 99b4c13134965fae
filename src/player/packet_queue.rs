use crate::player::codec::Packet;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// 数据包队列（单路流）
///
/// 不限长度：压缩数据很小，内存上限由帧队列和解封装线程的读包节流保证。
/// 新建时处于中止状态，解码器启动时调用 `start`。
pub struct PacketQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

struct QueueInner {
    packets: VecDeque<Packet>,
    bytes: usize,
    aborted: bool,
    serial: u64,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                packets: VecDeque::new(),
                bytes: 0,
                aborted: true,
                serial: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// 入队并唤醒一个等待者；已中止时直接丢弃
    pub fn push(&self, mut packet: Packet) -> bool {
        let mut inner = self.inner.lock();
        if inner.aborted {
            return false;
        }
        packet.serial = inner.serial;
        inner.bytes += packet.size();
        inner.packets.push_back(packet);
        self.cond.notify_one();
        true
    }

    /// 阻塞出队；中止时返回 None
    pub fn pop(&self) -> Option<Packet> {
        let mut inner = self.inner.lock();
        loop {
            if inner.aborted {
                return None;
            }
            if let Some(packet) = inner.packets.pop_front() {
                inner.bytes -= packet.size();
                return Some(packet);
            }
            self.cond.wait(&mut inner);
        }
    }

    /// 带超时的出队，超时返回 None（不区分中止，调用方自行检查）
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Packet> {
        let mut inner = self.inner.lock();
        if inner.packets.is_empty() && !inner.aborted {
            self.cond.wait_for(&mut inner, timeout);
        }
        if inner.aborted {
            return None;
        }
        let packet = inner.packets.pop_front()?;
        inner.bytes -= packet.size();
        Some(packet)
    }

    /// 清空队列并递增序号，返回新序号
    pub fn flush(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.packets.clear();
        inner.bytes = 0;
        inner.serial += 1;
        inner.serial
    }

    /// 永久中止（直到再次 `start`），唤醒所有等待者
    pub fn abort(&self) {
        let mut inner = self.inner.lock();
        inner.aborted = true;
        self.cond.notify_all();
    }

    pub fn start(&self) {
        self.inner.lock().aborted = false;
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted
    }

    pub fn serial(&self) -> u64 {
        self.inner.lock().serial
    }

    pub fn len(&self) -> usize {
        self.inner.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().packets.is_empty()
    }

    /// 队列中压缩数据的字节数
    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn packet(pts: i64, size: usize) -> Packet {
        Packet {
            pts: Some(pts),
            data: vec![0u8; size],
            ..Default::default()
        }
    }

    #[test]
    fn test_push_rejected_until_started() {
        let queue = PacketQueue::new();
        assert!(!queue.push(packet(0, 4)));
        assert!(queue.is_empty());

        queue.start();
        assert!(queue.push(packet(0, 4)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.bytes(), 4);
    }

    #[test]
    fn test_fifo_order() {
        let queue = PacketQueue::new();
        queue.start();
        for pts in 0..5 {
            queue.push(packet(pts, 1));
        }
        for pts in 0..5 {
            assert_eq!(queue.pop().unwrap().pts, Some(pts));
        }
        assert_eq!(queue.bytes(), 0);
    }

    #[test]
    fn test_flush_bumps_serial() {
        let queue = PacketQueue::new();
        queue.start();
        queue.push(packet(0, 10));
        queue.push(packet(1, 10));
        assert_eq!(queue.serial(), 0);

        let serial = queue.flush();
        assert_eq!(serial, 1);
        assert!(queue.is_empty());
        assert_eq!(queue.bytes(), 0);

        queue.push(packet(2, 1));
        assert_eq!(queue.pop().unwrap().serial, 1);
    }

    #[test]
    fn test_abort_wakes_blocked_pop() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let q = queue.clone();
        let consumer = thread::spawn(move || q.pop());
        thread::sleep(Duration::from_millis(20));
        queue.abort();
        assert!(consumer.join().unwrap().is_none());
        assert!(!queue.push(packet(0, 1)));
    }

    #[test]
    fn test_pop_timeout_returns_on_empty() {
        let queue = PacketQueue::new();
        queue.start();
        assert!(queue.pop_timeout(Duration::from_millis(5)).is_none());
        queue.push(packet(7, 1));
        assert_eq!(queue.pop_timeout(Duration::from_millis(5)).unwrap().pts, Some(7));
    }

    #[test]
    fn test_blocked_pop_receives_later_push() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let q = queue.clone();
        let consumer = thread::spawn(move || q.pop());
        thread::sleep(Duration::from_millis(10));
        queue.push(packet(42, 1));
        assert_eq!(consumer.join().unwrap().unwrap().pts, Some(42));
    }
}
