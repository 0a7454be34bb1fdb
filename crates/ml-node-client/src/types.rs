//! Wire-adjacent DTOs passed to `InitGenerate`/`InitValidate` (§4.2).

#[derive(Clone, Debug)]
pub struct PocInitDto {
    pub block_height: u64,
    pub block_hash: String,
    pub pubkey: String,
    pub callback_url: String,
    /// `cur_max_node_num + 1` — a ceiling used by ML nodes for shard-space
    /// sizing (§4.5.4).
    pub total_nodes: u64,
}
