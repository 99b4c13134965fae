use crate::player::codec::VideoFrame;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// 帧队列槽位
///
/// 槽位的帧缓冲区在队列的整个生命周期内原地复用。
#[derive(Debug, Default)]
pub struct FrameSlot {
    pub frame: VideoFrame,
    /// 显示时间戳（毫秒），未知为 None
    pub pts_ms: Option<i64>,
    /// 时长（毫秒）
    pub duration_ms: i64,
    pub serial: u64,
    pub rendered: bool,
}

impl FrameSlot {
    fn release(&mut self) {
        self.frame.reset();
        self.pts_ms = None;
        self.duration_ms = 0;
        self.rendered = false;
    }
}

struct RingState {
    rindex: usize,
    windex: usize,
    size: usize,
    aborted: bool,
    serial: u64,
}

/// 视频帧环形队列
///
/// 固定容量，写满时生产者阻塞，读空时消费者阻塞。锁顺序固定为
/// 先 `state` 后槽位锁；持有槽位锁时不得再调用 `pop` / `flush`。
pub struct FrameQueue {
    slots: Box<[Mutex<FrameSlot>]>,
    state: Mutex<RingState>,
    cond: Condvar,
    flush_lock: Mutex<()>,
    /// 等待或正在执行的 flush 数，在拿到 flush 锁之前就已计入
    flush_pending: AtomicUsize,
}

impl FrameQueue {
    /// 创建队列（初始为中止状态）
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| Mutex::new(FrameSlot::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            state: Mutex::new(RingState {
                rindex: 0,
                windex: 0,
                size: 0,
                aborted: true,
                serial: 0,
            }),
            cond: Condvar::new(),
            flush_lock: Mutex::new(()),
            flush_pending: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 等待一个可写槽位；中止时返回 None
    pub fn acquire_writable(&self) -> Option<WritableSlot<'_>> {
        let index = {
            let mut state = self.state.lock();
            while state.size >= self.slots.len() && !state.aborted {
                self.cond.wait(&mut state);
            }
            if state.aborted {
                return None;
            }
            state.windex
        };
        Some(WritableSlot {
            queue: self,
            slot: self.slots[index].lock(),
        })
    }

    fn publish_slot(&self, serial: u64) -> bool {
        let mut state = self.state.lock();
        if state.aborted || serial != state.serial {
            return false;
        }
        state.windex = (state.windex + 1) % self.slots.len();
        state.size += 1;
        self.cond.notify_all();
        true
    }

    /// 最旧的一帧（不出队）；返回的锁必须在 `pop` 之前释放
    pub fn front(&self) -> Option<MutexGuard<'_, FrameSlot>> {
        let index = {
            let state = self.state.lock();
            if state.size == 0 {
                return None;
            }
            state.rindex
        };
        Some(self.slots[index].lock())
    }

    /// 出队最旧的一帧，唤醒生产者
    pub fn pop(&self) -> bool {
        let mut state = self.state.lock();
        if state.size == 0 {
            return false;
        }
        self.slots[state.rindex].lock().release();
        state.rindex = (state.rindex + 1) % self.slots.len();
        state.size -= 1;
        self.cond.notify_all();
        true
    }

    /// 在超时内等待至少一帧
    pub fn wait_for_frame(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.size == 0 && !state.aborted {
            self.cond.wait_for(&mut state, timeout);
        }
        state.size > 0 && !state.aborted
    }

    /// 清空所有帧
    pub fn flush(&self) {
        self.flush_pending.fetch_add(1, Ordering::SeqCst);
        {
            let _guard = self.flush_lock.lock();
            while self.pop() {}
        }
        self.flush_pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// 切换到新序号并清空；旧序号的槽位此后无法发布
    pub fn flush_to(&self, serial: u64) {
        self.flush_pending.fetch_add(1, Ordering::SeqCst);
        {
            let _guard = self.flush_lock.lock();
            self.state.lock().serial = serial;
            while self.pop() {}
        }
        self.flush_pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// 渲染决策期间持有，阻止并发 flush
    pub fn flush_guard(&self) -> MutexGuard<'_, ()> {
        self.flush_lock.lock()
    }

    /// 有线程在等待或执行 flush；持有 flush 锁的一方应尽快释放
    pub fn is_flushing(&self) -> bool {
        self.flush_pending.load(Ordering::SeqCst) > 0
    }

    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.cond.notify_all();
    }

    pub fn start(&self) {
        self.state.lock().aborted = false;
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    pub fn serial(&self) -> u64 {
        self.state.lock().serial
    }

    pub fn len(&self) -> usize {
        self.state.lock().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 可写槽位
///
/// 写入后调用 `publish`；直接丢弃则不入队。
pub struct WritableSlot<'a> {
    queue: &'a FrameQueue,
    slot: MutexGuard<'a, FrameSlot>,
}

impl<'a> WritableSlot<'a> {
    /// 发布到队列；槽位序号已过期或队列已中止时返回 false
    pub fn publish(self) -> bool {
        let serial = self.slot.serial;
        let WritableSlot { queue, slot } = self;
        drop(slot);
        queue.publish_slot(serial)
    }
}

impl<'a> Deref for WritableSlot<'a> {
    type Target = FrameSlot;

    fn deref(&self) -> &FrameSlot {
        &self.slot
    }
}

impl<'a> DerefMut for WritableSlot<'a> {
    fn deref_mut(&mut self) -> &mut FrameSlot {
        &mut self.slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn push(queue: &FrameQueue, pts: i64) -> bool {
        let serial = queue.serial();
        match queue.acquire_writable() {
            Some(mut slot) => {
                slot.pts_ms = Some(pts);
                slot.serial = serial;
                slot.publish()
            }
            None => false,
        }
    }

    fn front_pts(queue: &FrameQueue) -> Option<i64> {
        queue.front().and_then(|slot| slot.pts_ms)
    }

    #[test]
    fn test_fifo_with_wraparound() {
        let queue = FrameQueue::new(3);
        queue.start();
        let mut next_pop = 0;
        for pts in 0..10 {
            assert!(push(&queue, pts));
            assert!(queue.len() <= queue.capacity());
            if queue.len() == 3 {
                assert_eq!(front_pts(&queue), Some(next_pop));
                assert!(queue.pop());
                next_pop += 1;
            }
        }
        while let Some(pts) = front_pts(&queue) {
            assert_eq!(pts, next_pop);
            queue.pop();
            next_pop += 1;
        }
        assert_eq!(next_pop, 10);
        assert!(!queue.pop());
    }

    #[test]
    fn test_producer_blocks_when_full() {
        let queue = Arc::new(FrameQueue::new(2));
        queue.start();
        assert!(push(&queue, 0));
        assert!(push(&queue, 1));

        let q = queue.clone();
        let producer = thread::spawn(move || push(&q, 2));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.len(), 2);

        queue.pop();
        assert!(producer.join().unwrap());
        assert_eq!(queue.len(), 2);
        assert_eq!(front_pts(&queue), Some(1));
    }

    #[test]
    fn test_abort_releases_blocked_producer() {
        let queue = Arc::new(FrameQueue::new(1));
        queue.start();
        assert!(push(&queue, 0));
        let q = queue.clone();
        let producer = thread::spawn(move || q.acquire_writable().is_none());
        thread::sleep(Duration::from_millis(20));
        queue.abort();
        assert!(producer.join().unwrap());
    }

    #[test]
    fn test_acquire_on_aborted_queue_fails() {
        let queue = FrameQueue::new(2);
        assert!(queue.acquire_writable().is_none());
    }

    #[test]
    fn test_flush_empties_queue() {
        let queue = FrameQueue::new(4);
        queue.start();
        for pts in 0..4 {
            push(&queue, pts);
        }
        queue.flush();
        assert!(queue.front().is_none());
        assert!(!queue.pop());
        assert!(queue.is_empty());
        assert!(!queue.is_flushing());
    }

    #[test]
    fn test_waiting_flush_is_visible_to_guard_holder() {
        let queue = Arc::new(FrameQueue::new(4));
        queue.start();
        push(&queue, 0);

        let guard = queue.flush_guard();
        let q = queue.clone();
        let flusher = thread::spawn(move || q.flush_to(7));
        // 持锁方可以看到有 flush 在等待
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !queue.is_flushing() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(queue.is_flushing());
        assert_eq!(queue.len(), 1);

        drop(guard);
        flusher.join().unwrap();
        assert!(!queue.is_flushing());
        assert!(queue.is_empty());
        assert_eq!(queue.serial(), 7);
    }

    #[test]
    fn test_stale_slot_rejected_after_flush() {
        let queue = Arc::new(FrameQueue::new(2));
        queue.start();
        let stale_serial = queue.serial();
        let mut slot = queue.acquire_writable().unwrap();
        slot.pts_ms = Some(100);
        slot.serial = stale_serial;

        // 生产者持有槽位期间另一个线程 flush
        let q = queue.clone();
        thread::spawn(move || q.flush_to(stale_serial + 1)).join().unwrap();

        assert!(!slot.publish());
        assert!(queue.is_empty());
        assert!(push(&queue, 200));
        assert_eq!(front_pts(&queue), Some(200));
    }

    #[test]
    fn test_pop_resets_slot_but_keeps_buffer() {
        let queue = FrameQueue::new(1);
        queue.start();
        {
            let mut slot = queue.acquire_writable().unwrap();
            slot.frame.fill_plane(0, &[9u8; 128], 16);
            slot.pts_ms = Some(5);
            assert!(slot.publish());
        }
        queue.pop();
        let slot = queue.acquire_writable().unwrap();
        assert!(slot.pts_ms.is_none());
        assert!(slot.frame.planes[0].is_empty());
        assert!(slot.frame.planes[0].capacity() >= 128);
    }

    #[test]
    fn test_concurrent_producer_consumer_keeps_order() {
        let queue = Arc::new(FrameQueue::new(3));
        queue.start();
        let q = queue.clone();
        let producer = thread::spawn(move || {
            for pts in 0..200 {
                if !push(&q, pts) {
                    break;
                }
            }
        });

        let mut expected = 0;
        while expected < 200 {
            if !queue.wait_for_frame(Duration::from_millis(100)) {
                continue;
            }
            let pts = front_pts(&queue);
            assert_eq!(pts, Some(expected));
            assert!(queue.len() <= 3);
            queue.pop();
            expected += 1;
        }
        producer.join().unwrap();
    }
}
