use crate::packet::Packet;

impl Packet {
    /// 16 bit sum with wrap-around (no carry folding) over all header fields except the
    ///  checksum itself plus each payload byte, complemented.
    pub fn compute_checksum(&self) -> u16 {
        let mut sum = self.src_port
            .wrapping_add(self.dst_port)
            .wrapping_add(self.length)
            .wrapping_add((self.seq_no >> 16) as u16)
            .wrapping_add(self.seq_no as u16)
            .wrapping_add((self.ack_no >> 16) as u16)
            .wrapping_add(self.ack_no as u16)
            .wrapping_add(self.flags.bits() as u16);

        for &b in self.payload.iter() {
            sum = sum.wrapping_add(b as u16);
        }

        !sum
    }

    pub fn set_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}
