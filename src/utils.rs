//! Utility functions

use crate::layout::BlockWindow;
use crate::types::DataType;

/// Reverse the bytes of every `word_size` word in place
pub fn swap_words(data: &mut [u8], word_size: usize) {
    if word_size <= 1 {
        return;
    }
    for word in data.chunks_exact_mut(word_size) {
        word.reverse();
    }
}

/// Convert big-endian stored pixels to host order (and back; the operation is
/// its own inverse)
pub fn big_endian_to_native(data: &mut [u8], data_type: DataType) {
    if needs_swap(data_type) {
        swap_words(data, data_type.word_size());
    }
}

/// True when big-endian storage differs from host order for this type
pub fn needs_swap(data_type: DataType) -> bool {
    cfg!(target_endian = "little") && data_type.word_size() > 1
}

/// Convert between a file byte order and host order
pub fn file_order_to_native(data: &mut [u8], data_type: DataType, file_is_big_endian: bool) {
    if file_is_big_endian != cfg!(target_endian = "big") {
        swap_words(data, data_type.word_size());
    }
}

/// True when every byte is zero
pub fn is_all_zero(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

/// Copy a window out of a full block buffer into a tightly packed output
pub fn copy_window_out(
    block: &[u8],
    block_width: usize,
    pixel_size: usize,
    window: &BlockWindow,
    out: &mut [u8],
) {
    let row_bytes = window.width * pixel_size;
    for row in 0..window.height {
        let src = ((window.y_off + row) * block_width + window.x_off) * pixel_size;
        let dst = row * row_bytes;
        out[dst..dst + row_bytes].copy_from_slice(&block[src..src + row_bytes]);
    }
}

/// Copy a rectangle between two row-major buffers with different strides
#[allow(clippy::too_many_arguments)]
pub fn copy_rect(
    src: &[u8],
    src_stride: usize,
    src_x: usize,
    src_y: usize,
    dst: &mut [u8],
    dst_stride: usize,
    dst_x: usize,
    dst_y: usize,
    width_bytes: usize,
    rows: usize,
) {
    for row in 0..rows {
        let s = (src_y + row) * src_stride + src_x;
        let d = (dst_y + row) * dst_stride + dst_x;
        dst[d..d + width_bytes].copy_from_slice(&src[s..s + width_bytes]);
    }
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_words() {
        let mut data = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        swap_words(&mut data, 2);
        assert_eq!(data, vec![2, 1, 4, 3, 6, 5, 8, 7]);
        swap_words(&mut data, 4);
        assert_eq!(data, vec![3, 4, 1, 2, 7, 8, 5, 6]);

        let mut bytes = vec![9u8, 8];
        swap_words(&mut bytes, 1);
        assert_eq!(bytes, vec![9, 8]);
    }

    #[test]
    fn test_big_endian_round_trip() {
        let value: u16 = 0x1234;
        let mut stored = value.to_be_bytes().to_vec();
        big_endian_to_native(&mut stored, DataType::U16);
        assert_eq!(stored, value.to_ne_bytes().to_vec());
        big_endian_to_native(&mut stored, DataType::U16);
        assert_eq!(stored, value.to_be_bytes().to_vec());
    }

    #[test]
    fn test_needs_swap() {
        assert!(!needs_swap(DataType::U8));
        assert_eq!(needs_swap(DataType::U16), cfg!(target_endian = "little"));
    }

    #[test]
    fn test_file_order_to_native() {
        let value: u32 = 0xDEADBEEF;
        let mut le = value.to_le_bytes().to_vec();
        file_order_to_native(&mut le, DataType::U32, false);
        assert_eq!(le, value.to_ne_bytes().to_vec());
    }

    #[test]
    fn test_is_all_zero() {
        assert!(is_all_zero(&[0u8; 64]));
        assert!(is_all_zero(&[]));
        let mut data = vec![0u8; 64];
        data[63] = 1;
        assert!(!is_all_zero(&data));
    }

    #[test]
    fn test_copy_window_out() {
        // 4x3 block, 1 byte per pixel
        let block: Vec<u8> = (0..12).collect();
        let window = BlockWindow::new(1, 1, 2, 2);
        let mut out = vec![0u8; 4];
        copy_window_out(&block, 4, 1, &window, &mut out);
        assert_eq!(out, vec![5, 6, 9, 10]);
    }

    #[test]
    fn test_copy_rect() {
        let src: Vec<u8> = (0..16).collect();
        let mut dst = vec![0u8; 9];
        copy_rect(&src, 4, 2, 2, &mut dst, 3, 1, 1, 2, 2);
        assert_eq!(dst, vec![0, 0, 0, 0, 10, 11, 0, 14, 15]);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }
}
