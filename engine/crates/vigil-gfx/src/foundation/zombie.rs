//! 延迟销毁队列
//!
//! 任意线程都可以投递 zombie（最后一个 handle 在哪个线程 drop 都可以），
//! 只有 Device 一个消费者，在 `clear_garbage` 中回收 GPU 已经不再使用的对象。

use crossbeam_channel::{Receiver, Sender};

use crate::resources::resource::{ResourceKey, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZombieEntry {
    /// 释放时的 CPU timeline，GPU timeline 追上之后才能销毁
    pub timeline: u64,
    pub key: ResourceKey,
    pub kind: ResourceKind,
}

/// 创建一对 zombie 的投递端和接收端
pub(crate) fn mailbox(warn_threshold: usize) -> (ZombieSender, ZombieQueue) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (
        ZombieSender { sender },
        ZombieQueue {
            receiver,
            pending: Vec::new(),
            warn_threshold,
            stalled: false,
        },
    )
}

#[derive(Clone)]
pub(crate) struct ZombieSender {
    sender: Sender<ZombieEntry>,
}

impl ZombieSender {
    pub fn post(&self, entry: ZombieEntry) {
        // Device 已经销毁，原生对象随之泄漏
        if self.sender.send(entry).is_err() {
            log::warn!("{:?} {:?} released after its device was destroyed", entry.kind, entry.key);
        }
    }
}

pub(crate) struct ZombieQueue {
    receiver: Receiver<ZombieEntry>,
    /// 已经收到但还没有回收的 zombie，按照投递顺序排列
    pending: Vec<ZombieEntry>,
    warn_threshold: usize,
    stalled: bool,
}

impl ZombieQueue {
    /// 从 mailbox 中取出所有新的 zombie，返回取出的数量
    pub fn collect(&mut self) -> usize {
        let before = self.pending.len();
        self.pending.extend(self.receiver.try_iter());
        self.pending.len() - before
    }

    /// 取出所有 `timeline <= gpu_timeline` 的 zombie
    pub fn take_retired(&mut self, gpu_timeline: u64) -> Vec<ZombieEntry> {
        let (retired, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.pending).into_iter().partition(|entry| entry.timeline <= gpu_timeline);
        self.pending = pending;
        retired
    }

    /// 不考虑 timeline 取出所有的 zombie，只能在 GPU idle 之后使用
    pub fn take_all(&mut self) -> Vec<ZombieEntry> {
        self.collect();
        std::mem::take(&mut self.pending)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// zombie 堆积说明 GPU timeline 不再推进，每次越过阈值只警告一次
    pub fn check_stall(&mut self, gpu_timeline: u64) {
        let stalled = self.pending.len() > self.warn_threshold;
        if stalled && !self.stalled {
            log::warn!(
                "{} zombies are waiting for the gpu timeline (currently {}), the gpu may have stopped making progress",
                self.pending.len(),
                gpu_timeline
            );
        }
        self.stalled = stalled;
    }
}

#[cfg(test)]
mod tests {
    use slotmap::{Key, SlotMap};

    use super::*;

    fn entry(timeline: u64) -> ZombieEntry {
        ZombieEntry {
            timeline,
            key: ResourceKey::null(),
            kind: ResourceKind::Buffer,
        }
    }

    #[test]
    fn test_take_retired_keeps_order_and_future_entries() {
        let (sender, mut queue) = mailbox(16);
        for timeline in [3, 1, 5, 2] {
            sender.post(entry(timeline));
        }
        assert_eq!(queue.collect(), 4);

        let retired = queue.take_retired(2).into_iter().map(|e| e.timeline).collect::<Vec<_>>();
        assert_eq!(retired, vec![1, 2]);
        assert_eq!(queue.len(), 2);

        assert!(queue.take_retired(2).is_empty());
        assert_eq!(queue.take_retired(10).len(), 2);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_post_from_many_threads() {
        let (sender, mut queue) = mailbox(1024);
        let mut keys = SlotMap::<ResourceKey, ()>::with_key();
        let key = keys.insert(());

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let sender = sender.clone();
                scope.spawn(move || {
                    for timeline in 0..100 {
                        sender.post(ZombieEntry {
                            timeline,
                            key,
                            kind: ResourceKind::Image,
                        });
                    }
                });
            }
        });

        assert_eq!(queue.collect(), 400);
        assert_eq!(queue.take_all().len(), 400);
    }

    #[test]
    fn test_post_after_consumer_dropped_is_ignored() {
        let (sender, queue) = mailbox(16);
        drop(queue);
        sender.post(entry(0));
    }
}
