//! Simulator packet reassembly
//!
//! Packet 0 carries `FIRST_PACKET_SIZE` bytes, every later packet except the
//! last carries exactly `MAX_IMG_PACKET_SIZE`. Packets may arrive in any
//! order; only the contiguous run starting at `first_packet` counts as
//! available.

use crate::image::{FIRST_PACKET_SIZE, MAX_IMG_PACKET_SIZE};

/// Outcome of inserting one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketInsert {
    Inserted,
    /// Already held; nothing changed
    Duplicate,
    /// Index past the total packet count
    OutOfRange,
    /// A middle packet whose size isn't `MAX_IMG_PACKET_SIZE`
    BadSize,
}

impl PacketInsert {
    /// Whether the packet counts as malformed
    pub fn is_bad(self) -> bool {
        matches!(self, PacketInsert::OutOfRange | PacketInsert::BadSize)
    }
}

/// Sparse packet buffer for one image
#[derive(Debug, Clone)]
pub struct PacketAssembler {
    packets: Vec<Option<Vec<u8>>>,
    /// First packet this pass needs (earlier bytes are already held)
    first_packet: i32,
    /// Last packet of the contiguous run (-1 = none yet)
    last_packet: i32,
    total_packets: i32,
}

impl Default for PacketAssembler {
    fn default() -> Self {
        Self {
            packets: Vec::new(),
            first_packet: 0,
            last_packet: -1,
            total_packets: 0,
        }
    }
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every packet and forget the packet counts
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn first_packet(&self) -> i32 {
        self.first_packet
    }

    pub fn last_packet(&self) -> i32 {
        self.last_packet
    }

    pub fn total_packets(&self) -> i32 {
        self.total_packets
    }

    pub fn set_total_packets(&mut self, total: i32) {
        self.total_packets = total;
    }

    /// Resume after `first_packet - 1` packets' worth of bytes already held
    pub fn resume_at(&mut self, first_packet: i32, total_packets: i32) {
        self.packets.clear();
        self.first_packet = first_packet;
        self.last_packet = first_packet - 1;
        self.total_packets = total_packets;
    }

    /// Whether the header (packet 0) or a resume point has been established
    pub fn has_header(&self) -> bool {
        self.last_packet != -1
    }

    /// Whether every packet through the last one is contiguous
    pub fn have_all(&self) -> bool {
        self.total_packets > 0 && self.last_packet >= self.total_packets - 1
    }

    /// Insert a packet by index
    pub fn insert(&mut self, index: i32, data: &[u8]) -> PacketInsert {
        if index < 0 || index >= self.total_packets {
            return PacketInsert::OutOfRange;
        }
        if index > 0 && index < self.total_packets - 1 && data.len() != MAX_IMG_PACKET_SIZE {
            return PacketInsert::BadSize;
        }

        let slot = index as usize;
        if slot >= self.packets.len() {
            self.packets.resize(slot + 1, None);
        } else if self.packets[slot].is_some() {
            return PacketInsert::Duplicate;
        }

        self.packets[slot] = Some(data.to_vec());
        while let Some(Some(_)) = self.packets.get((self.last_packet + 1) as usize) {
            self.last_packet += 1;
        }
        PacketInsert::Inserted
    }

    fn contiguous(&self) -> impl Iterator<Item = &[u8]> {
        let start = self.first_packet.max(0) as usize;
        let end = (self.last_packet + 1).max(0) as usize;
        self.packets
            .get(start..end.min(self.packets.len()))
            .unwrap_or(&[])
            .iter()
            .filter_map(|p| p.as_deref())
    }

    /// Bytes in the contiguous run received this pass
    pub fn contiguous_bytes(&self) -> usize {
        self.contiguous().map(<[u8]>::len).sum()
    }

    /// Append the contiguous run to `out`
    pub fn append_contiguous(&self, out: &mut Vec<u8>) {
        for packet in self.contiguous() {
            out.extend_from_slice(packet);
        }
    }

    /// Bytes available for progress reporting
    pub fn progress_bytes(&self) -> usize {
        if self.last_packet < 1 {
            return if self.last_packet == 0 { FIRST_PACKET_SIZE } else { 0 };
        }
        FIRST_PACKET_SIZE + (self.last_packet as usize - 1) * MAX_IMG_PACKET_SIZE
    }
}

/// Packet index a simulator transfer resumes at when `held` bytes are
/// already present, or `None` if `held` does not end on a packet boundary
pub fn resume_packet(held: usize) -> Option<i32> {
    if held == 0 {
        return Some(0);
    }
    if held < FIRST_PACKET_SIZE || (held - FIRST_PACKET_SIZE) % MAX_IMG_PACKET_SIZE != 0 {
        return None;
    }
    Some(((held - FIRST_PACKET_SIZE) / MAX_IMG_PACKET_SIZE) as i32 + 1)
}

/// Number of packets a `file_size`-byte image is sent in
pub fn packet_count(file_size: usize) -> i32 {
    if file_size <= FIRST_PACKET_SIZE {
        return 1;
    }
    ((file_size - FIRST_PACKET_SIZE).div_ceil(MAX_IMG_PACKET_SIZE) + 1) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_packet_image() -> Vec<Vec<u8>> {
        vec![
            vec![1; FIRST_PACKET_SIZE],
            vec![2; MAX_IMG_PACKET_SIZE],
            vec![3; 123],
        ]
    }

    fn assembled(order: &[usize]) -> (PacketAssembler, Vec<u8>) {
        let packets = three_packet_image();
        let mut assembler = PacketAssembler::new();
        assembler.set_total_packets(3);
        for &i in order {
            assert_eq!(assembler.insert(i as i32, &packets[i]), PacketInsert::Inserted);
        }
        let mut out = Vec::new();
        assembler.append_contiguous(&mut out);
        (assembler, out)
    }

    #[test]
    fn test_out_of_order_matches_in_order() {
        let (in_order, a) = assembled(&[0, 1, 2]);
        let (out_of_order, b) = assembled(&[0, 2, 1]);
        assert_eq!(a, b);
        assert_eq!(a.len(), FIRST_PACKET_SIZE + MAX_IMG_PACKET_SIZE + 123);
        assert!(in_order.have_all());
        assert!(out_of_order.have_all());
    }

    #[test]
    fn test_gap_holds_back_later_packets() {
        let packets = three_packet_image();
        let mut assembler = PacketAssembler::new();
        assembler.set_total_packets(3);
        assembler.insert(0, &packets[0]);
        assembler.insert(2, &packets[2]);

        assert_eq!(assembler.last_packet(), 0);
        assert_eq!(assembler.contiguous_bytes(), FIRST_PACKET_SIZE);
        assert!(!assembler.have_all());

        assembler.insert(1, &packets[1]);
        assert_eq!(assembler.last_packet(), 2);
    }

    #[test]
    fn test_duplicate_is_noop() {
        let packets = three_packet_image();
        let mut assembler = PacketAssembler::new();
        assembler.set_total_packets(3);
        assembler.insert(0, &packets[0]);

        assert_eq!(assembler.insert(0, &[9; FIRST_PACKET_SIZE]), PacketInsert::Duplicate);
        let mut out = Vec::new();
        assembler.append_contiguous(&mut out);
        assert_eq!(out, packets[0]);
        assert!(!PacketInsert::Duplicate.is_bad());
    }

    #[test]
    fn test_rejects_out_of_range_and_bad_size() {
        let mut assembler = PacketAssembler::new();
        assembler.set_total_packets(3);

        let result = assembler.insert(3, &[0; 10]);
        assert_eq!(result, PacketInsert::OutOfRange);
        assert!(result.is_bad());
        assert_eq!(assembler.insert(-1, &[0; 10]), PacketInsert::OutOfRange);

        // Middle packets must be full size; the last one may be short
        assert_eq!(assembler.insert(1, &[0; 999]), PacketInsert::BadSize);
        assert_eq!(assembler.insert(2, &[0; 5]), PacketInsert::Inserted);
    }

    #[test]
    fn test_resume_point() {
        assert_eq!(resume_packet(0), Some(0));
        assert_eq!(resume_packet(FIRST_PACKET_SIZE), Some(1));
        assert_eq!(resume_packet(FIRST_PACKET_SIZE + 2 * MAX_IMG_PACKET_SIZE), Some(3));
        assert_eq!(resume_packet(FIRST_PACKET_SIZE + 10), None);
        assert_eq!(resume_packet(100), None);

        let mut assembler = PacketAssembler::new();
        assembler.resume_at(2, 4);
        assert!(assembler.has_header());
        assert_eq!(assembler.last_packet(), 1);
        assert_eq!(assembler.insert(2, &[0; MAX_IMG_PACKET_SIZE]), PacketInsert::Inserted);
        assert_eq!(assembler.last_packet(), 2);
        assert_eq!(assembler.contiguous_bytes(), MAX_IMG_PACKET_SIZE);
    }

    #[test]
    fn test_packet_count() {
        assert_eq!(packet_count(100), 1);
        assert_eq!(packet_count(FIRST_PACKET_SIZE), 1);
        assert_eq!(packet_count(FIRST_PACKET_SIZE + 1), 2);
        assert_eq!(packet_count(FIRST_PACKET_SIZE + MAX_IMG_PACKET_SIZE), 2);
        assert_eq!(packet_count(FIRST_PACKET_SIZE + MAX_IMG_PACKET_SIZE + 1), 3);
    }
}
