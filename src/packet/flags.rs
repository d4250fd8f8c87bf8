use std::fmt::{Display, Formatter};

bitflags::bitflags! {
    /// The control bits of an RDTP packet. The codec does not restrict combinations, it is up
    ///  to the handshake logic to decide which combinations are meaningful.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u8 {
        const SYN = 0x80;
        const ACK = 0x40;
        const FIN = 0x20;
        const ERR = 0x10;
    }
}

impl Flags {
    pub fn control(syn: bool, ack: bool, fin: bool, err: bool) -> Flags {
        let mut flags = Flags::empty();
        flags.set(Flags::SYN, syn);
        flags.set(Flags::ACK, ack);
        flags.set(Flags::FIN, fin);
        flags.set(Flags::ERR, err);
        flags
    }
}

impl Display for Flags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{SYN[{}] ACK[{}] FIN[{}] ERR[{}]}}",
               self.contains(Flags::SYN),
               self.contains(Flags::ACK),
               self.contains(Flags::FIN),
               self.contains(Flags::ERR),
        )
    }
}
