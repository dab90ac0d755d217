//! XOR forward error correction for the reliable-UDP channel.
//!
//! Every group of `group_size` data packets produces one parity packet that
//! is the XOR of each packet's `[len_hi, len_lo, payload...]`. If exactly one
//! packet of a group is lost and the parity arrived, the receiver rebuilds
//! the missing packet immediately instead of waiting a round trip for the
//! ARQ retransmit. XOR parity is single-loss only; groups with two or more
//! losses fall through to normal retransmission.
//!
//! Packet layout: `[type][group][index][group_size][len u16 BE][payload]`.

pub const FEC_HEADER_LEN: usize = 6;

const TYPE_DATA: u8 = 0x01;
const TYPE_PARITY: u8 = 0x02;

/// Groups recent enough to still be completable. Older groups are evicted
/// ring-buffer style.
const MAX_LIVE_GROUPS: usize = 4;

pub struct FecEncoder {
    group_size: u8,
    max_packet_len: usize,
    group_id: u8,
    index: u8,
    parity: Vec<u8>,
    parity_len: usize,
}

impl FecEncoder {
    pub fn new(group_size: u8, max_packet_len: usize) -> Self {
        assert!(group_size >= 1);
        Self {
            group_size,
            max_packet_len,
            group_id: 0,
            index: 0,
            parity: vec![0; max_packet_len],
            parity_len: 0,
        }
    }

    /// Encode one datagram. `emit` is called once for the framed data packet
    /// and once more with the parity packet when a group completes.
    /// Oversized payloads bypass FEC untouched.
    pub fn encode(&mut self, payload: &[u8], mut emit: impl FnMut(&[u8])) {
        if payload.is_empty() || payload.len() > self.max_packet_len - FEC_HEADER_LEN {
            if !payload.is_empty() {
                emit(payload);
            }
            return;
        }

        let len = payload.len() as u16;
        let mut framed = Vec::with_capacity(FEC_HEADER_LEN + payload.len());
        framed.push(TYPE_DATA);
        framed.push(self.group_id);
        framed.push(self.index);
        framed.push(self.group_size);
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(payload);
        emit(&framed);

        // Fold [len, payload] into the running parity.
        let folded = payload.len() + 2;
        if folded > self.parity.len() {
            self.parity.resize(folded, 0);
        }
        self.parity[0] ^= (len >> 8) as u8;
        self.parity[1] ^= (len & 0xff) as u8;
        for (p, b) in self.parity[2..].iter_mut().zip(payload) {
            *p ^= b;
        }
        self.parity_len = self.parity_len.max(folded);
        self.index += 1;

        if self.index >= self.group_size {
            let mut parity = Vec::with_capacity(FEC_HEADER_LEN + self.parity_len);
            parity.push(TYPE_PARITY);
            parity.push(self.group_id);
            parity.push(self.group_size);
            parity.push(self.group_size);
            parity.extend_from_slice(&(self.parity_len as u16).to_be_bytes());
            parity.extend_from_slice(&self.parity[..self.parity_len]);
            emit(&parity);

            self.group_id = self.group_id.wrapping_add(1);
            self.index = 0;
            self.parity_len = 0;
            self.parity.fill(0);
        }
    }
}

#[derive(Default)]
struct FecGroup {
    group_size: u8,
    received: Vec<bool>,
    received_count: usize,
    packets: Vec<Vec<u8>>,
    parity: Option<Vec<u8>>,
    recovered: bool,
}

impl FecGroup {
    fn reset(&mut self, group_size: u8) {
        self.group_size = group_size;
        self.received = vec![false; group_size as usize];
        self.received_count = 0;
        self.packets = vec![Vec::new(); group_size as usize];
        self.parity = None;
        self.recovered = false;
    }
}

#[derive(Default)]
struct GroupSlot {
    id: u8,
    active: bool,
    group: FecGroup,
}

pub struct FecDecoder {
    max_group_size: u8,
    groups: [GroupSlot; MAX_LIVE_GROUPS],
    next_slot: usize,
    recovered_total: u64,
}

impl FecDecoder {
    pub fn new(max_group_size: u8) -> Self {
        Self {
            max_group_size,
            groups: Default::default(),
            next_slot: 0,
            recovered_total: 0,
        }
    }

    /// Packets reconstructed so far, for the metrics poll.
    pub fn recovered_total(&self) -> u64 {
        self.recovered_total
    }

    /// Decode one datagram. `emit` receives each original payload: once for
    /// a data packet, and once more for a reconstructed packet when parity
    /// completes a group with a single loss. Unframed packets pass through.
    pub fn decode(&mut self, packet: &[u8], mut emit: impl FnMut(&[u8])) {
        if packet.len() < FEC_HEADER_LEN || (packet[0] != TYPE_DATA && packet[0] != TYPE_PARITY) {
            if !packet.is_empty() {
                emit(packet);
            }
            return;
        }

        let ty = packet[0];
        let group_id = packet[1];
        let index = packet[2];
        let group_size = packet[3];
        if group_size == 0 || group_size > self.max_group_size {
            return;
        }
        let declared_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;
        let body = &packet[FEC_HEADER_LEN..];

        let group = self.group_mut(group_id, group_size);

        if ty == TYPE_DATA {
            if declared_len == 0 || declared_len > body.len() {
                return;
            }
            if (index as usize) < group.received.len() && !group.received[index as usize] {
                group.received[index as usize] = true;
                group.received_count += 1;
                // Keep [len, payload] exactly as folded into the parity.
                group.packets[index as usize] = packet[4..].to_vec();
            }
            emit(&body[..declared_len]);
        } else {
            if declared_len == 0 || declared_len > body.len() {
                return;
            }
            group.parity = Some(body[..declared_len].to_vec());
        }

        let recovered = Self::try_recover(self.group_mut(group_id, group_size));
        if let Some(payload) = recovered {
            self.recovered_total += 1;
            emit(&payload);
        }
    }

    fn group_mut(&mut self, id: u8, group_size: u8) -> &mut FecGroup {
        if let Some(i) = self
            .groups
            .iter()
            .position(|s| s.active && s.id == id && s.group.group_size == group_size)
        {
            return &mut self.groups[i].group;
        }
        let slot = &mut self.groups[self.next_slot % MAX_LIVE_GROUPS];
        self.next_slot += 1;
        slot.id = id;
        slot.active = true;
        slot.group.reset(group_size);
        &mut slot.group
    }

    fn try_recover(group: &mut FecGroup) -> Option<Vec<u8>> {
        if group.recovered || group.parity.is_none() {
            return None;
        }
        if group.received_count + 1 != group.group_size as usize {
            return None;
        }
        let missing = group.received.iter().position(|r| !r)?;
        group.recovered = true;

        let mut acc = group.parity.clone().unwrap();
        for (i, pkt) in group.packets.iter().enumerate() {
            if i == missing {
                continue;
            }
            for (a, b) in acc.iter_mut().zip(pkt) {
                *a ^= b;
            }
        }

        if acc.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([acc[0], acc[1]]) as usize;
        if len == 0 || len > acc.len() - 2 {
            return None;
        }
        Some(acc[2..2 + len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_group(encoder: &mut FecEncoder, payloads: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut framed = Vec::new();
        for p in payloads {
            encoder.encode(p, |pkt| framed.push(pkt.to_vec()));
        }
        framed
    }

    #[test]
    fn group_emits_parity_packet() {
        let mut enc = FecEncoder::new(4, 1400);
        let payloads: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 10 + i as usize]).collect();
        let framed = run_group(&mut enc, &payloads);
        assert_eq!(framed.len(), 5);
        assert_eq!(framed[4][0], TYPE_PARITY);
    }

    #[test]
    fn zero_loss_passes_through_unchanged() {
        let mut enc = FecEncoder::new(4, 1400);
        let mut dec = FecDecoder::new(16);
        let payloads: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i + 1; 20]).collect();
        let mut out = Vec::new();
        for pkt in run_group(&mut enc, &payloads) {
            dec.decode(&pkt, |p| out.push(p.to_vec()));
        }
        assert_eq!(out, payloads);
        assert_eq!(dec.recovered_total(), 0);
    }

    #[test]
    fn single_loss_is_reconstructed() {
        let mut enc = FecEncoder::new(10, 1400);
        let mut dec = FecDecoder::new(16);
        let payloads: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 30 + i as usize]).collect();
        let framed = run_group(&mut enc, &payloads);
        assert_eq!(framed.len(), 11);

        let mut out = Vec::new();
        for (i, pkt) in framed.iter().enumerate() {
            if i == 3 {
                continue; // drop one data packet
            }
            dec.decode(pkt, |p| out.push(p.to_vec()));
        }

        assert_eq!(dec.recovered_total(), 1);
        assert_eq!(out.len(), 10);
        // The reconstructed packet arrives last, after the parity.
        assert_eq!(out[9], payloads[3]);
    }

    #[test]
    fn double_loss_is_not_reconstructed() {
        let mut enc = FecEncoder::new(10, 1400);
        let mut dec = FecDecoder::new(16);
        let payloads: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 40]).collect();
        let framed = run_group(&mut enc, &payloads);

        let mut out = Vec::new();
        for (i, pkt) in framed.iter().enumerate() {
            if i == 2 || i == 7 {
                continue;
            }
            dec.decode(pkt, |p| out.push(p.to_vec()));
        }
        assert_eq!(out.len(), 8);
        assert_eq!(dec.recovered_total(), 0);
    }

    #[test]
    fn oversized_payload_bypasses_fec() {
        let mut enc = FecEncoder::new(4, 100);
        let big = vec![0xaa; 200];
        let mut out = Vec::new();
        enc.encode(&big, |pkt| out.push(pkt.to_vec()));
        assert_eq!(out, vec![big.clone()]);

        let mut dec = FecDecoder::new(16);
        let mut through = Vec::new();
        dec.decode(&big, |p| through.push(p.to_vec()));
        assert_eq!(through, vec![big]);
    }
}
