//! 单槽共享寄存器
//! Single-slot, last-writer-wins shared register
//!
//! 帧缓冲、瞄准结果、机器人状态、待发送指令各自持有一个独立的寄存器。
//! 每次写入完整替换旧值;读取方拿到的永远是某一次完整写入的值。

use std::sync::{Mutex, MutexGuard};

/// 单槽寄存器 (非队列)
#[derive(Debug, Default)]
pub struct Register<T> {
    slot: Mutex<T>,
}

impl<T> Register<T> {
    pub fn new(value: T) -> Self {
        Self {
            slot: Mutex::new(value),
        }
    }

    /// 在锁内执行闭包,临界区随闭包结束而结束
    ///
    /// 闭包内不得执行推理或I/O调用。
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.guard();
        f(&mut guard)
    }

    /// 覆盖写入,返回被替换的旧值
    pub fn replace(&self, value: T) -> T {
        self.with_lock(|slot| std::mem::replace(slot, value))
    }

    pub fn set(&self, value: T) {
        self.replace(value);
    }

    // 写入方只做整值替换,中毒的锁里仍然是完整的值
    fn guard(&self) -> MutexGuard<'_, T> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone> Register<T> {
    /// 拷贝出当前值并立即释放锁
    pub fn get(&self) -> T {
        self.with_lock(|slot| slot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_last_writer_wins() {
        let reg = Register::new(1);
        reg.set(2);
        reg.set(3);
        assert_eq!(reg.get(), 3);
        assert_eq!(reg.replace(4), 3);
        assert_eq!(reg.get(), 4);
    }

    #[test]
    fn test_readers_never_see_torn_pairs() {
        // 成对写入 (n, n*2),读取方必须总是看到匹配的一对
        let reg = Arc::new(Register::new((0u64, 0u64)));
        let writer = {
            let reg = reg.clone();
            thread::spawn(move || {
                for n in 1..5_000u64 {
                    reg.set((n, n * 2));
                }
            })
        };
        for _ in 0..5_000 {
            let (a, b) = reg.get();
            assert_eq!(b, a * 2);
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_with_lock_returns_closure_value() {
        let reg = Register::new(vec![1, 2, 3]);
        let len = reg.with_lock(|v| {
            v.push(4);
            v.len()
        });
        assert_eq!(len, 4);
    }
}
