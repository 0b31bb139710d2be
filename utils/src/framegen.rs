use bufferqueue::graphic_buffer::GraphicBuffer;
use bufferqueue::PixelFormat;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NewFrameGeneratorError {
    #[error("Unsupported pixel format {0}")]
    UnsupportedFormat(PixelFormat),
    #[error("Invalid stride")]
    InvalidStride,
}

#[derive(Debug, Error)]
pub enum GenerateFrameError {
    #[error("Provided buffer is too small")]
    BufferTooSmall,
}

/// Fills frames with a moving pattern. The first pixel of each frame encodes
/// the number of frames generated before it, so consumers can check they
/// received the frames in order.
pub struct FrameGenerator {
    width: usize,
    height: usize,
    /// Line length, in bytes.
    stride: usize,
    bpp: usize,
    step: u32,
}

impl FrameGenerator {
    /// `stride` is the length of a line in pixels, as reported by
    /// [`GraphicBuffer::stride`].
    pub fn new(
        width: usize,
        height: usize,
        stride: usize,
        format: PixelFormat,
    ) -> Result<Self, NewFrameGeneratorError> {
        let bpp = match format.bytes_per_pixel() {
            Some(bpp) if bpp >= 3 => bpp as usize,
            _ => return Err(NewFrameGeneratorError::UnsupportedFormat(format)),
        };
        if stride < width {
            return Err(NewFrameGeneratorError::InvalidStride);
        }

        Ok(FrameGenerator {
            width,
            height,
            stride: stride * bpp,
            bpp,
            step: 0,
        })
    }

    /// Creates a generator matching the layout of `buffer`.
    pub fn for_buffer(buffer: &GraphicBuffer) -> Result<Self, NewFrameGeneratorError> {
        Self::new(
            buffer.width() as usize,
            buffer.height() as usize,
            buffer.stride() as usize,
            buffer.format(),
        )
    }

    pub fn frame_size(&self) -> usize {
        self.stride * self.height
    }

    pub fn next_frame<S: AsMut<[u8]>>(&mut self, frame: &mut S) -> Result<(), GenerateFrameError> {
        let frame = frame.as_mut();

        if frame.len() < self.frame_size() {
            return Err(GenerateFrameError::BufferTooSmall);
        }

        self.gen_pattern(frame);
        self.step = self.step.wrapping_add(1);

        Ok(())
    }

    /// Returns the step encoded in a frame produced by [`Self::next_frame`],
    /// modulo 2^24.
    pub fn frame_step(frame: &[u8]) -> Option<u32> {
        match frame {
            [r, g, b, ..] => Some(u32::from_le_bytes([*r, *g, *b, 0])),
            _ => None,
        }
    }

    fn gen_pattern(&mut self, frame: &mut [u8]) {
        let bpp = self.bpp;

        frame
            .chunks_exact_mut(self.stride)
            .take(self.height)
            .map(|l| &mut l[0..self.width * bpp])
            .enumerate()
            .for_each(|(y, line)| {
                line.chunks_exact_mut(bpp).enumerate().for_each(|(x, pixel)| {
                    let rgba = self.step.wrapping_add((x ^ y) as u32).to_le_bytes();
                    pixel[0] = rgba[0];
                    pixel[1] = rgba[1];
                    pixel[2] = rgba[2];
                    if bpp > 3 {
                        pixel[3] = 0xff;
                    }
                });
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern() {
        let mut gen = FrameGenerator::new(4, 2, 8, PixelFormat::RGBA_8888).unwrap();
        let mut frame = vec![0u8; gen.frame_size()];
        assert_eq!(frame.len(), 64);

        gen.next_frame(&mut frame).unwrap();
        assert_eq!(FrameGenerator::frame_step(&frame), Some(0));
        // Pixel (1, 0).
        assert_eq!(&frame[4..8], &[1, 0, 0, 0xff]);
        // Padding is left alone.
        assert_eq!(&frame[16..32], &[0u8; 16]);

        gen.next_frame(&mut frame).unwrap();
        assert_eq!(FrameGenerator::frame_step(&frame), Some(1));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(
            FrameGenerator::new(4, 2, 2, PixelFormat::RGBA_8888),
            Err(NewFrameGeneratorError::InvalidStride)
        ));
        assert!(matches!(
            FrameGenerator::new(4, 2, 4, PixelFormat::RGB_565),
            Err(NewFrameGeneratorError::UnsupportedFormat(_))
        ));

        let mut gen = FrameGenerator::new(4, 2, 4, PixelFormat::RGB_888).unwrap();
        let mut frame = vec![0u8; 10];
        assert!(matches!(
            gen.next_frame(&mut frame),
            Err(GenerateFrameError::BufferTooSmall)
        ));
    }
}
