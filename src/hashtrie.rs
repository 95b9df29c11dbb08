//! The copy-on-write hash trie index.
//!
//! Every table maps 32-bit keys to cell chunks through a trie that
//! consumes `hashtrie_bits` of the key per level, least significant
//! bits first. Interior nodes are fragment chunks (tag word, key word,
//! one child word per branch); leaves are cell or root chunks. A
//! lookup path is at most `32 / hashtrie_bits` levels deep, and a node
//! whose recorded key disagrees with the search path marks a damaged
//! index.
//!
//! Writes never touch committed nodes: the path from root to the
//! changed leaf is copied into blocks owned by the writing
//! transaction, the copies are patched, and the old blocks are logged
//! as candidates for the next usage sweep. Readers keep following the
//! old root until the new one is committed.

use tracing::trace;

use crate::database::Database;
use crate::error::{Error, Result};
use crate::format::{self, get_word, put_word, ChunkId, TxnId, TOO_DEEP};
use crate::transaction::Transaction;
use crate::usage::StatusList;

fn low_bits(recur_level: u32) -> u32 {
    ((1u64 << recur_level) - 1) as u32
}

/// A loaded trie chunk: an interior node or a leaf cell.
enum Node {
    Interior { data: Vec<u8>, owner: TxnId },
    Leaf { key: u32, owner: TxnId },
}

impl Database {
    fn ht_load(&mut self, chunk: ChunkId) -> Result<Node> {
        if self.geo.is_big(chunk) {
            let block = self.geo.chunk_block(chunk);
            let data = self.cache.get(&self.io, block)?;
            if get_word(data, 2) != format::BLOCK_BIG {
                return Err(Error::WrongBlockType {
                    block,
                    found: get_word(data, 2),
                });
            }
            let owner = TxnId::new(get_word(data, 0), get_word(data, 1));
            let tag = get_word(data, 5);
            if tag != format::CHUNK_CELL && tag != format::CHUNK_ROOT {
                return Err(Error::WrongChunkType {
                    chunk: chunk.raw(),
                    found: tag,
                });
            }
            return Ok(Node::Leaf {
                key: get_word(data, 6),
                owner,
            });
        }
        let (data, owner) = self.frag_read_owned(chunk)?;
        match get_word(&data, 0) {
            format::CHUNK_HASHTRIE => Ok(Node::Interior { data, owner }),
            format::CHUNK_CELL | format::CHUNK_ROOT => Ok(Node::Leaf {
                key: get_word(&data, 1),
                owner,
            }),
            found => Err(Error::WrongChunkType {
                chunk: chunk.raw(),
                found,
            }),
        }
    }

    fn ht_new_node(&mut self, txn: &mut Transaction, table: u32) -> Result<ChunkId> {
        let size = self.geo.node_size();
        let chunk = self.frag_new(txn, table, size)?;
        let data = self.frag_get_mut(txn.id, chunk)?;
        data[..size].fill(0);
        put_word(data, 0, format::CHUNK_HASHTRIE);
        Ok(chunk)
    }

    /// Copies key word and children of `old` into a node we own.
    fn ht_copy_node(&mut self, txn: &mut Transaction, table: u32, old: &[u8]) -> Result<ChunkId> {
        let chunk = self.ht_new_node(txn, table)?;
        let n = 4 + 4 * self.geo.fanout();
        let data = self.frag_get_mut(txn.id, chunk)?;
        data[4..4 + n].copy_from_slice(&old[4..4 + n]);
        Ok(chunk)
    }

    /// Looks up `key`; zero when absent.
    pub(crate) fn hashtrie_find(&mut self, table: u32, root: ChunkId, key: u32) -> Result<ChunkId> {
        Ok(self.ht_find(table, key, root, 0, key)?.0)
    }

    /// Looks up `key` and reports the owner of the block holding it.
    pub(crate) fn hashtrie_find_owned(
        &mut self,
        table: u32,
        root: ChunkId,
        key: u32,
    ) -> Result<(ChunkId, TxnId)> {
        self.ht_find(table, key, root, 0, key)
    }

    fn ht_find(
        &mut self,
        table: u32,
        orig_key: u32,
        chunk: ChunkId,
        recur_level: u32,
        key_left: u32,
    ) -> Result<(ChunkId, TxnId)> {
        if chunk.is_none() {
            return Ok((ChunkId::NONE, TxnId::ZERO));
        }
        match self.ht_load(chunk)? {
            Node::Leaf { key, owner } => {
                if key == orig_key {
                    Ok((chunk, owner))
                } else {
                    Ok((ChunkId::NONE, owner))
                }
            }
            Node::Interior { data, .. } => {
                if recur_level > TOO_DEEP {
                    return Err(Error::RecursionTooDeep {
                        table,
                        key: orig_key,
                    });
                }
                let v = (key_left & self.geo.level_mask()) as usize;
                let child = ChunkId::from_raw(get_word(&data, 2 + v));
                self.ht_find(
                    table,
                    orig_key,
                    child,
                    recur_level + self.geo.hashtrie_bits,
                    key_left >> self.geo.hashtrie_bits,
                )
            }
        }
    }

    /// Points `key` at `cell` (or deletes it when `cell` is zero),
    /// copying the path as needed. Returns the new root, the replaced
    /// cell, and whether the replaced cell was ours.
    pub(crate) fn hashtrie_write(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        root: ChunkId,
        key: u32,
        cell: ChunkId,
    ) -> Result<(ChunkId, ChunkId, bool)> {
        self.ht_write(txn, table, key, cell, root, key, 0)
    }

    fn ht_write(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        orig_key: u32,
        cell: ChunkId,
        node_id: ChunkId,
        key_left: u32,
        recur_level: u32,
    ) -> Result<(ChunkId, ChunkId, bool)> {
        if node_id.is_none() {
            return Ok((cell, ChunkId::NONE, false));
        }
        let geo = self.geo;
        match self.ht_load(node_id)? {
            Node::Interior { data, owner } => {
                let filter = low_bits(recur_level);
                if get_word(&data, 1) & filter != orig_key & filter {
                    return Err(Error::IndexAstray {
                        table,
                        key: orig_key,
                    });
                }
                if recur_level > TOO_DEEP {
                    return Err(Error::RecursionTooDeep {
                        table,
                        key: orig_key,
                    });
                }
                let new_node = if owner != txn.id {
                    if (0..geo.fanout()).all(|i| get_word(&data, 2 + i) == 0) {
                        // nothing to keep in it; drop instead of copy
                        self.tr_unused(txn, geo.chunk_block(node_id))?;
                        return Ok((cell, ChunkId::NONE, false));
                    }
                    let copy = self.ht_copy_node(txn, table, &data)?;
                    self.tr_unused(txn, geo.chunk_block(node_id))?;
                    copy
                } else {
                    node_id
                };
                let v = (key_left & geo.level_mask()) as usize;
                let child = ChunkId::from_raw(get_word(&data, 2 + v));
                let (child1, old_cell, old_is_mine) = self.ht_write(
                    txn,
                    table,
                    orig_key,
                    cell,
                    child,
                    key_left >> geo.hashtrie_bits,
                    recur_level + geo.hashtrie_bits,
                )?;
                if child1 != child {
                    let node = self.frag_get_mut(txn.id, new_node)?;
                    put_word(node, 2 + v, child1.raw());
                }
                Ok((new_node, old_cell, old_is_mine))
            }
            Node::Leaf { key, owner } => {
                if key == orig_key {
                    let mine = owner == txn.id;
                    self.tr_unused(txn, geo.chunk_block(node_id))?;
                    return Ok((cell, node_id, mine));
                }
                if cell.is_none() {
                    // deleting a key that was never there
                    return Ok((node_id, ChunkId::NONE, false));
                }
                if recur_level > TOO_DEEP {
                    return Err(Error::RecursionTooDeep {
                        table,
                        key: orig_key,
                    });
                }
                // Two keys share the path this far; push the old cell
                // one level down and try again from the new node.
                let v = ((key >> recur_level) & geo.level_mask()) as usize;
                let split = self.ht_new_node(txn, table)?;
                {
                    let node = self.frag_get_mut(txn.id, split)?;
                    put_word(node, 1, orig_key);
                    put_word(node, 2 + v, node_id.raw());
                }
                trace!(table, key = orig_key, level = recur_level, "leaf split");
                self.ht_write(txn, table, orig_key, cell, split, key_left, recur_level)
            }
        }
    }

    /// Collects up to `max` keys in trie order. `start` resumes a scan
    /// after that key; `restrict_to` skips every subtree not owned by
    /// the given transaction.
    pub(crate) fn hashtrie_scan(
        &mut self,
        table: u32,
        root: ChunkId,
        start: Option<u32>,
        restrict_to: Option<TxnId>,
        max: usize,
    ) -> Result<Vec<(u32, ChunkId)>> {
        let mut out = Vec::new();
        let key = start.unwrap_or(0);
        self.ht_scan(
            table,
            key,
            root,
            restrict_to,
            0,
            key,
            max,
            start.is_none(),
            &mut out,
        )?;
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn ht_scan(
        &mut self,
        table: u32,
        orig_key: u32,
        node_id: ChunkId,
        restrict_to: Option<TxnId>,
        recur_level: u32,
        key_left: u32,
        max: usize,
        take_first: bool,
        out: &mut Vec<(u32, ChunkId)>,
    ) -> Result<()> {
        if node_id.is_none() {
            return Ok(());
        }
        if recur_level > TOO_DEEP {
            return Err(Error::RecursionTooDeep {
                table,
                key: orig_key,
            });
        }
        match self.ht_load(node_id)? {
            Node::Leaf { key, owner } => {
                if let Some(id) = restrict_to {
                    if owner != id {
                        return Ok(());
                    }
                }
                if take_first || key != orig_key {
                    out.push((key, node_id));
                }
                Ok(())
            }
            Node::Interior { data, owner } => {
                if let Some(id) = restrict_to {
                    if owner != id {
                        return Ok(());
                    }
                }
                let fanout = self.geo.fanout();
                let children: Vec<u32> = (0..fanout).map(|i| get_word(&data, 2 + i)).collect();
                let mut v = (key_left & self.geo.level_mask()) as usize;
                let mut left = key_left >> self.geo.hashtrie_bits;
                loop {
                    let child = ChunkId::from_raw(children[v]);
                    if !child.is_none() {
                        self.ht_scan(
                            table,
                            orig_key,
                            child,
                            restrict_to,
                            recur_level + self.geo.hashtrie_bits,
                            left,
                            max,
                            take_first,
                            out,
                        )?;
                        if out.len() == max {
                            return Ok(());
                        }
                    }
                    v += 1;
                    left = 0;
                    if v == fanout {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Finds an unused key no smaller (in trie order) than `minimum`.
    /// Returns `u32::MAX` when everything from the minimum up is taken.
    pub(crate) fn hashtrie_find_no_key(
        &mut self,
        table: u32,
        root: ChunkId,
        minimum: u32,
    ) -> Result<u32> {
        self.ht_find_no_key(table, minimum, root, 0, minimum)
    }

    fn ht_find_no_key(
        &mut self,
        table: u32,
        orig_key: u32,
        node_id: ChunkId,
        recur_level: u32,
        key_left: u32,
    ) -> Result<u32> {
        if node_id.is_none() {
            return Ok(orig_key);
        }
        if recur_level > TOO_DEEP {
            return Err(Error::RecursionTooDeep {
                table,
                key: orig_key,
            });
        }
        let filter = low_bits(recur_level);
        match self.ht_load(node_id)? {
            Node::Leaf { key, .. } => {
                if key == orig_key {
                    let next = ((key_left as u64 + 1) << recur_level) as u32;
                    let dest = (orig_key & filter) | next;
                    Ok(if dest == 0 { u32::MAX } else { dest })
                } else {
                    Ok(orig_key)
                }
            }
            Node::Interior { data, .. } => {
                let fanout = self.geo.fanout();
                let children: Vec<u32> = (0..fanout).map(|i| get_word(&data, 2 + i)).collect();
                let v = (key_left & self.geo.level_mask()) as usize;
                for (i, &child) in children.iter().enumerate().skip(v) {
                    if child == 0 {
                        // no key at all ends in these bits
                        return Ok((orig_key & filter) | ((i as u64) << recur_level) as u32);
                    }
                }
                let mut min = u32::MAX;
                let mut left = key_left >> self.geo.hashtrie_bits;
                let mut base = orig_key;
                for (i, &child) in children.iter().enumerate().skip(v) {
                    if child != 0 {
                        let down = base | ((i as u64) << recur_level) as u32;
                        let dest = self.ht_find_no_key(
                            table,
                            down,
                            ChunkId::from_raw(child),
                            recur_level + self.geo.hashtrie_bits,
                            left,
                        )?;
                        min = min.min(dest);
                    }
                    left = 0;
                    base = orig_key & filter;
                }
                Ok(min)
            }
        }
    }

    /// Merges freshly committed state into this transaction's trie.
    /// `root_m` is the transaction's root, `root_o` the committed one;
    /// returns the merged root. A key both sides changed is a
    /// conflict, except that a cell we wrote ourselves wins.
    pub(crate) fn hashtrie_resolve(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        root_m: ChunkId,
        root_o: ChunkId,
    ) -> Result<ChunkId> {
        self.ht_resolve(txn, table, root_m, root_o, 0)
    }

    fn ht_resolve(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        node_m: ChunkId,
        node_o: ChunkId,
        recur_level: u32,
    ) -> Result<ChunkId> {
        if node_m.is_none() {
            return Ok(node_o);
        }
        let geo = self.geo;
        let m = self.ht_load(node_m)?;
        let (key_m, owner_m, m_children) = match &m {
            Node::Leaf { key, owner } => (*key, *owner, None),
            Node::Interior { data, owner } => (
                get_word(data, 1),
                *owner,
                Some(
                    (0..geo.fanout())
                        .map(|i| get_word(data, 2 + i))
                        .collect::<Vec<u32>>(),
                ),
            ),
        };
        if owner_m != txn.id {
            // this subtree was never ours; the committed side wins
            return Ok(node_o);
        }
        if node_o.is_none() {
            return Ok(node_m);
        }
        let o = self.ht_load(node_o)?;
        let (key_o, o_leaf) = match &o {
            Node::Leaf { key, .. } => (*key, true),
            Node::Interior { data, .. } => (get_word(data, 1), false),
        };
        let filter = low_bits(recur_level);
        if key_m & filter != key_o & filter {
            return Err(Error::IndexAstray {
                table,
                key: key_m,
            });
        }

        let mut children = match m_children {
            Some(c) => c,
            None => {
                // our side is a single cell here
                if o_leaf && key_m == key_o {
                    // we rewrote the same key; ours is the resolution
                    return Ok(node_m);
                }
                if recur_level > TOO_DEEP {
                    return Err(Error::RecursionTooDeep { table, key: key_m });
                }
                if !o_leaf {
                    self.tr_unused(txn, geo.chunk_block(node_o))?;
                }
                let v = ((key_m >> recur_level) & geo.level_mask()) as usize;
                let split = self.ht_new_node(txn, table)?;
                {
                    let node = self.frag_get_mut(txn.id, split)?;
                    put_word(node, 1, key_m);
                    put_word(node, 2 + v, node_m.raw());
                }
                return self.ht_resolve(txn, table, split, node_o, recur_level);
            }
        };

        let mut need_save = false;
        if o_leaf {
            if recur_level > TOO_DEEP {
                return Err(Error::RecursionTooDeep { table, key: key_o });
            }
            let v = ((key_o >> recur_level) & geo.level_mask()) as usize;
            let id_m = ChunkId::from_raw(children[v]);
            if node_o != id_m {
                if id_m.is_none() {
                    children[v] = node_o.raw();
                    need_save = true;
                } else {
                    let merged = self.ht_resolve(
                        txn,
                        table,
                        id_m,
                        node_o,
                        recur_level + geo.hashtrie_bits,
                    )?;
                    if merged != id_m {
                        children[v] = merged.raw();
                        need_save = true;
                    }
                }
            }
        } else {
            let o_children: Vec<u32> = match &o {
                Node::Interior { data, .. } => {
                    (0..geo.fanout()).map(|i| get_word(data, 2 + i)).collect()
                }
                Node::Leaf { .. } => unreachable!("o_leaf is false"),
            };
            for v in (0..geo.fanout()).rev() {
                let id_m = ChunkId::from_raw(children[v]);
                let id_o = ChunkId::from_raw(o_children[v]);
                if id_m != id_o {
                    if id_m.is_none() {
                        children[v] = id_o.raw();
                        need_save = true;
                    } else {
                        let merged = self.ht_resolve(
                            txn,
                            table,
                            id_m,
                            id_o,
                            recur_level + geo.hashtrie_bits,
                        )?;
                        if merged != id_m {
                            children[v] = merged.raw();
                            need_save = true;
                        }
                    }
                }
            }
        }

        if need_save {
            let data = self.frag_get_mut(txn.id, node_m)?;
            for (i, child) in children.iter().enumerate() {
                put_word(data, 2 + i, *child);
            }
        }
        Ok(node_m)
    }

    /// Marks every block of a whole trie unused. Used by table delete.
    pub(crate) fn hashtrie_free_all(&mut self, txn: &mut Transaction, root: ChunkId) -> Result<()> {
        if root.is_none() {
            return Ok(());
        }
        let block = self.geo.chunk_block(root);
        self.tr_unused(txn, block)?;
        self.ht_free(txn, root, 0)
    }

    fn ht_free(&mut self, txn: &mut Transaction, node_id: ChunkId, recur_level: u32) -> Result<()> {
        if recur_level > TOO_DEEP {
            return Err(Error::RecursionTooDeep { table: 0, key: 0 });
        }
        if self.geo.is_big(node_id) {
            // big leaves are freed by their parent
            return Ok(());
        }
        let data = self.frag_read(node_id)?;
        if get_word(&data, 0) != format::CHUNK_HASHTRIE {
            return Ok(());
        }
        let fanout = self.geo.fanout();
        let children: Vec<u32> = (0..fanout).map(|i| get_word(&data, 2 + i)).collect();
        for raw in children.into_iter().rev() {
            let child = ChunkId::from_raw(raw);
            if child.is_none() {
                continue;
            }
            let block = self.geo.chunk_block(child);
            if self.geo.is_big(child) {
                self.tr_unused(txn, block)?;
            } else {
                self.ht_free(txn, child, recur_level + self.geo.hashtrie_bits)?;
                self.tr_unused(txn, block)?;
            }
        }
        Ok(())
    }

    /// Re-applies a delete after resolve: the committed side brought
    /// `key` back, and this transaction's delete must win again.
    pub(crate) fn hashtrie_redelete(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        root: ChunkId,
        key: u32,
    ) -> Result<ChunkId> {
        self.ht_redelete(txn, table, key, root, key, 0)
    }

    fn ht_redelete(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        orig_key: u32,
        node_id: ChunkId,
        key_left: u32,
        recur_level: u32,
    ) -> Result<ChunkId> {
        if node_id.is_none() {
            return Ok(ChunkId::NONE);
        }
        let geo = self.geo;
        match self.ht_load(node_id)? {
            Node::Leaf { key, owner } => {
                if key == orig_key && owner != txn.id {
                    // committed cell for a key we deleted; its block
                    // was already logged unused the first time around
                    Ok(ChunkId::NONE)
                } else {
                    Ok(node_id)
                }
            }
            Node::Interior { data, owner } => {
                if recur_level > TOO_DEEP {
                    return Err(Error::RecursionTooDeep {
                        table,
                        key: orig_key,
                    });
                }
                let filter = low_bits(recur_level);
                if get_word(&data, 1) & filter != orig_key & filter {
                    return Err(Error::IndexAstray {
                        table,
                        key: orig_key,
                    });
                }
                let new_node = if owner != txn.id {
                    let copy = self.ht_copy_node(txn, table, &data)?;
                    self.tr_unused(txn, geo.chunk_block(node_id))?;
                    copy
                } else {
                    node_id
                };
                let v = (key_left & geo.level_mask()) as usize;
                let child = ChunkId::from_raw(get_word(&data, 2 + v));
                let child1 = if child.is_none() {
                    ChunkId::NONE
                } else {
                    self.ht_redelete(
                        txn,
                        table,
                        orig_key,
                        child,
                        key_left >> geo.hashtrie_bits,
                        recur_level + geo.hashtrie_bits,
                    )?
                };
                if child1 != child {
                    let node = self.frag_get_mut(txn.id, new_node)?;
                    put_word(node, 2 + v, child1.raw());
                }
                if child1.is_none() {
                    let node = self.frag_read(new_node)?;
                    if (0..geo.fanout()).all(|i| get_word(&node, 2 + i) == 0) {
                        self.tr_unused(txn, geo.chunk_block(node_id))?;
                        return Ok(ChunkId::NONE);
                    }
                }
                Ok(new_node)
            }
        }
    }

    /// Marks every block reachable from `key` as used, for the sweep
    /// that frees unused-block candidates.
    pub(crate) fn hashtrie_mark_use(
        &mut self,
        table: u32,
        root: ChunkId,
        key: u32,
        used: &mut StatusList,
    ) -> Result<()> {
        self.ht_mark_use(table, key, root, 0, key, used)
    }

    fn ht_mark_use(
        &mut self,
        table: u32,
        orig_key: u32,
        chunk: ChunkId,
        recur_level: u32,
        key_left: u32,
        used: &mut StatusList,
    ) -> Result<()> {
        if chunk.is_none() {
            return Ok(());
        }
        let geo = self.geo;
        used.mark_used(geo.chunk_block(chunk));
        if geo.is_big(chunk) {
            // follow the continuation chain of a chained cell
            let mut block = geo.chunk_block(chunk);
            loop {
                let data = self.cache.get(&self.io, block)?;
                if get_word(data, 2) != format::BLOCK_BIG {
                    return Ok(());
                }
                let next = ChunkId::from_raw(get_word(data, 4));
                if next.is_none() {
                    return Ok(());
                }
                block = geo.chunk_block(next);
                used.mark_used(block);
                if !geo.is_big(next) {
                    return Ok(());
                }
            }
        }
        let data = self.frag_read(chunk)?;
        if get_word(&data, 0) != format::CHUNK_HASHTRIE {
            return Ok(());
        }
        if recur_level > TOO_DEEP {
            return Err(Error::RecursionTooDeep {
                table,
                key: orig_key,
            });
        }
        let filter = low_bits(recur_level);
        if get_word(&data, 1) & filter != orig_key & filter {
            return Err(Error::IndexAstray {
                table,
                key: orig_key,
            });
        }
        let v = (key_left & geo.level_mask()) as usize;
        let child = ChunkId::from_raw(get_word(&data, 2 + v));
        self.ht_mark_use(
            table,
            orig_key,
            child,
            recur_level + geo.hashtrie_bits,
            key_left >> geo.hashtrie_bits,
            used,
        )
    }
}
