//! 单槽帧缓冲
//! Overwrite-on-write buffer holding only the newest frame
//!
//! 彩色与深度作为一个 `Arc<Frame>` 整体替换,读取方不会拿到错配的帧对。
//! 不保留历史,慢消费者直接跳帧。

use std::sync::Arc;

use super::frame::Frame;
use crate::register::Register;

#[derive(Debug, Default)]
pub struct FrameBuffer {
    slot: Register<Option<Arc<Frame>>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发布最新帧,替换旧帧
    pub fn publish(&self, frame: Frame) {
        self.slot.set(Some(Arc::new(frame)));
    }

    /// 最新帧;尚未发布过时返回 None
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.slot.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use ndarray::Array2;
    use std::thread;

    fn frame(seq: u64, depth: u16) -> Frame {
        Frame::new(
            RgbImage::from_pixel(4, 3, image::Rgb([seq as u8, 0, 0])),
            Array2::from_elem((3, 4), depth),
            seq,
        )
    }

    #[test]
    fn test_empty_until_published() {
        let buffer = FrameBuffer::new();
        assert!(buffer.latest().is_none());
        buffer.publish(frame(1, 10));
        assert_eq!(buffer.latest().unwrap().sequence, 1);
    }

    #[test]
    fn test_latest_is_idempotent() {
        let buffer = FrameBuffer::new();
        buffer.publish(frame(7, 10));
        let a = buffer.latest().unwrap();
        let b = buffer.latest().unwrap();
        let c = buffer.latest().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
    }

    #[test]
    fn test_publish_replaces_without_history() {
        let buffer = FrameBuffer::new();
        for seq in 0..5 {
            buffer.publish(frame(seq, 10));
        }
        assert_eq!(buffer.latest().unwrap().sequence, 4);
    }

    #[test]
    fn test_color_and_depth_stay_paired() {
        // 彩色R通道与深度值由同一序号生成,读取方必须看到一致的一对
        let buffer = Arc::new(FrameBuffer::new());
        let writer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                for seq in 0..2_000u64 {
                    buffer.publish(frame(seq % 200, (seq % 200) as u16));
                }
            })
        };
        for _ in 0..2_000 {
            if let Some(f) = buffer.latest() {
                let red = f.color.get_pixel(0, 0).0[0];
                assert_eq!(u16::from(red), f.depth[[0, 0]]);
            }
        }
        writer.join().unwrap();
    }
}
