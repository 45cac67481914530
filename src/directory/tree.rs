//! Red-black sibling trees
//!
//! Each storage's children form one red-black tree keyed by [`compare_names`].
//! Nodes are directory entries; links are SIDs with NOSTREAM as the nil leaf.
//! Insert and delete follow the classic CLRS algorithms, using the in-memory
//! parent links; after a rotation at the top of a tree the owning storage's
//! child link is updated.
//!
//! Trees read from disk are not guaranteed to be balanced or correctly
//! coloured, so every helper treats NOSTREAM as a black leaf and never
//! dereferences it.

use super::{Directory, compare_names};
use crate::consts::*;
use crate::error::{Error, Result};
use std::cmp::Ordering;

const NIL: u32 = NOSTREAM;

impl Directory {
    fn node(&self, sid: u32) -> Option<&super::DirEntry> {
        if sid == NIL { None } else { self.get(sid) }
    }

    fn left(&self, sid: u32) -> u32 {
        self.node(sid).map_or(NIL, |n| n.left)
    }

    fn right(&self, sid: u32) -> u32 {
        self.node(sid).map_or(NIL, |n| n.right)
    }

    fn parent(&self, sid: u32) -> u32 {
        self.node(sid).map_or(NIL, |n| n.parent)
    }

    fn is_red(&self, sid: u32) -> bool {
        self.node(sid).is_some_and(|n| n.color == COLOR_RED)
    }

    fn color(&self, sid: u32) -> u8 {
        self.node(sid).map_or(COLOR_BLACK, |n| n.color)
    }

    fn update(&mut self, sid: u32, f: impl FnOnce(&mut super::DirEntry)) {
        if sid != NIL {
            if let Some(node) = self.get_mut(sid) {
                f(node);
            }
        }
    }

    fn set_left(&mut self, sid: u32, value: u32) {
        self.update(sid, |n| n.left = value);
    }

    fn set_right(&mut self, sid: u32, value: u32) {
        self.update(sid, |n| n.right = value);
    }

    fn set_parent(&mut self, sid: u32, value: u32) {
        self.update(sid, |n| n.parent = value);
    }

    fn set_color(&mut self, sid: u32, color: u8) {
        self.update(sid, |n| n.color = color);
    }

    fn tree_root(&self, owner: u32) -> u32 {
        self.node(owner).map_or(NIL, |n| n.child())
    }

    fn set_tree_root(&mut self, owner: u32, sid: u32) {
        self.update(owner, |n| n.set_child(sid));
        self.set_parent(sid, NIL);
    }

    /// Upper bound on hops through any sibling tree
    fn step_limit(&self) -> usize {
        self.len() + 1
    }

    /// Look up a child of `owner` by name, case-insensitively
    pub fn find(&self, owner: u32, name: &str) -> Result<Option<u32>> {
        let mut current = self.tree_root(owner);
        for _ in 0..self.step_limit() {
            let Some(node) = self.node(current) else {
                return Ok(None);
            };
            current = match compare_names(name, &node.name) {
                Ordering::Equal => return Ok(Some(current)),
                Ordering::Less => node.left,
                Ordering::Greater => node.right,
            };
        }
        Err(Error::corrupted(format!(
            "sibling tree of entry {owner} does not terminate"
        )))
    }

    /// Children of `owner` in sibling order
    pub fn children(&self, owner: u32) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        let mut stack = Vec::new();
        let mut current = self.tree_root(owner);
        let limit = self.step_limit();

        while current != NIL || !stack.is_empty() {
            while current != NIL {
                if stack.len() + out.len() > limit {
                    return Err(Error::corrupted(format!(
                        "sibling tree of entry {owner} does not terminate"
                    )));
                }
                stack.push(current);
                current = self.left(current);
            }
            if let Some(sid) = stack.pop() {
                out.push(sid);
                current = self.right(sid);
            }
        }
        Ok(out)
    }

    /// Link an allocated entry into the sibling tree of `owner`
    ///
    /// Fails with a name collision, leaving the tree untouched, when a sibling
    /// has the same name case-insensitively.
    pub fn insert(&mut self, owner: u32, sid: u32) -> Result<()> {
        let name = self
            .node(sid)
            .map(|n| n.name.clone())
            .ok_or_else(|| Error::InvalidOperation(format!("entry {sid} does not exist")))?;

        let mut parent = NIL;
        let mut current = self.tree_root(owner);
        let mut went_left = false;
        let mut steps = 0;
        while let Some(node) = self.node(current) {
            steps += 1;
            if steps > self.step_limit() {
                return Err(Error::corrupted(format!(
                    "sibling tree of entry {owner} does not terminate"
                )));
            }
            parent = current;
            match compare_names(&name, &node.name) {
                Ordering::Equal => {
                    return Err(Error::NameCollision(format!(
                        "'{name}' collides with existing entry '{}'",
                        node.name
                    )));
                }
                Ordering::Less => {
                    went_left = true;
                    current = node.left;
                }
                Ordering::Greater => {
                    went_left = false;
                    current = node.right;
                }
            }
        }

        self.update(sid, |n| {
            n.parent = parent;
            n.left = NIL;
            n.right = NIL;
            n.color = COLOR_RED;
        });
        if parent == NIL {
            self.set_tree_root(owner, sid);
        } else if went_left {
            self.set_left(parent, sid);
        } else {
            self.set_right(parent, sid);
        }
        self.insert_fixup(owner, sid);
        Ok(())
    }

    fn rotate_left(&mut self, owner: u32, x: u32) {
        let y = self.right(x);
        if y == NIL {
            return;
        }
        let y_left = self.left(y);
        self.set_right(x, y_left);
        self.set_parent(y_left, x);
        self.replace_child(owner, x, y);
        self.set_left(y, x);
        self.set_parent(x, y);
    }

    fn rotate_right(&mut self, owner: u32, x: u32) {
        let y = self.left(x);
        if y == NIL {
            return;
        }
        let y_right = self.right(y);
        self.set_left(x, y_right);
        self.set_parent(y_right, x);
        self.replace_child(owner, x, y);
        self.set_right(y, x);
        self.set_parent(x, y);
    }

    /// Put `new` where `old` hangs under its parent (or at the tree root)
    fn replace_child(&mut self, owner: u32, old: u32, new: u32) {
        let parent = self.parent(old);
        if parent == NIL {
            self.set_tree_root(owner, new);
            return;
        }
        if self.left(parent) == old {
            self.set_left(parent, new);
        } else {
            self.set_right(parent, new);
        }
        self.set_parent(new, parent);
    }

    fn insert_fixup(&mut self, owner: u32, mut z: u32) {
        while self.is_red(self.parent(z)) {
            let p = self.parent(z);
            let g = self.parent(p);
            if g == NIL {
                break;
            }
            if p == self.left(g) {
                let uncle = self.right(g);
                if self.is_red(uncle) {
                    self.set_color(p, COLOR_BLACK);
                    self.set_color(uncle, COLOR_BLACK);
                    self.set_color(g, COLOR_RED);
                    z = g;
                } else {
                    if z == self.right(p) {
                        z = p;
                        self.rotate_left(owner, z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, COLOR_BLACK);
                    self.set_color(g, COLOR_RED);
                    self.rotate_right(owner, g);
                }
            } else {
                let uncle = self.left(g);
                if self.is_red(uncle) {
                    self.set_color(p, COLOR_BLACK);
                    self.set_color(uncle, COLOR_BLACK);
                    self.set_color(g, COLOR_RED);
                    z = g;
                } else {
                    if z == self.left(p) {
                        z = p;
                        self.rotate_right(owner, z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, COLOR_BLACK);
                    self.set_color(g, COLOR_RED);
                    self.rotate_left(owner, g);
                }
            }
        }
        let root = self.tree_root(owner);
        self.set_color(root, COLOR_BLACK);
    }

    fn minimum(&self, mut sid: u32) -> u32 {
        for _ in 0..self.step_limit() {
            let left = self.left(sid);
            if left == NIL {
                break;
            }
            sid = left;
        }
        sid
    }

    /// Unlink `z` from the sibling tree of `owner` and rebalance
    ///
    /// The entry itself is left in place with nil links; releasing its slot is
    /// up to the caller.
    pub fn remove(&mut self, owner: u32, z: u32) -> Result<()> {
        if self.node(z).is_none() {
            return Err(Error::InvalidOperation(format!("entry {z} does not exist")));
        }

        let mut removed_color = self.color(z);
        let x;
        let x_parent;

        if self.left(z) == NIL {
            x = self.right(z);
            x_parent = self.parent(z);
            self.replace_child(owner, z, x);
        } else if self.right(z) == NIL {
            x = self.left(z);
            x_parent = self.parent(z);
            self.replace_child(owner, z, x);
        } else {
            let y = self.minimum(self.right(z));
            removed_color = self.color(y);
            x = self.right(y);
            if self.parent(y) == z {
                x_parent = y;
            } else {
                x_parent = self.parent(y);
                self.replace_child(owner, y, x);
                let z_right = self.right(z);
                self.set_right(y, z_right);
                self.set_parent(z_right, y);
            }
            self.replace_child(owner, z, y);
            let z_left = self.left(z);
            self.set_left(y, z_left);
            self.set_parent(z_left, y);
            self.set_color(y, self.color(z));
        }

        if removed_color == COLOR_BLACK {
            self.delete_fixup(owner, x, x_parent);
        }

        self.update(z, |n| {
            n.left = NIL;
            n.right = NIL;
            n.parent = NIL;
        });
        Ok(())
    }

    fn delete_fixup(&mut self, owner: u32, mut x: u32, mut x_parent: u32) {
        while x != self.tree_root(owner) && !self.is_red(x) {
            if x_parent == NIL {
                break;
            }
            if x == self.left(x_parent) {
                let mut w = self.right(x_parent);
                if self.is_red(w) {
                    self.set_color(w, COLOR_BLACK);
                    self.set_color(x_parent, COLOR_RED);
                    self.rotate_left(owner, x_parent);
                    w = self.right(x_parent);
                }
                if w == NIL {
                    x = x_parent;
                    x_parent = self.parent(x);
                    continue;
                }
                if !self.is_red(self.left(w)) && !self.is_red(self.right(w)) {
                    self.set_color(w, COLOR_RED);
                    x = x_parent;
                    x_parent = self.parent(x);
                } else {
                    if !self.is_red(self.right(w)) {
                        self.set_color(self.left(w), COLOR_BLACK);
                        self.set_color(w, COLOR_RED);
                        self.rotate_right(owner, w);
                        w = self.right(x_parent);
                    }
                    self.set_color(w, self.color(x_parent));
                    self.set_color(x_parent, COLOR_BLACK);
                    self.set_color(self.right(w), COLOR_BLACK);
                    self.rotate_left(owner, x_parent);
                    x = self.tree_root(owner);
                    x_parent = NIL;
                }
            } else {
                let mut w = self.left(x_parent);
                if self.is_red(w) {
                    self.set_color(w, COLOR_BLACK);
                    self.set_color(x_parent, COLOR_RED);
                    self.rotate_right(owner, x_parent);
                    w = self.left(x_parent);
                }
                if w == NIL {
                    x = x_parent;
                    x_parent = self.parent(x);
                    continue;
                }
                if !self.is_red(self.left(w)) && !self.is_red(self.right(w)) {
                    self.set_color(w, COLOR_RED);
                    x = x_parent;
                    x_parent = self.parent(x);
                } else {
                    if !self.is_red(self.left(w)) {
                        self.set_color(self.right(w), COLOR_BLACK);
                        self.set_color(w, COLOR_RED);
                        self.rotate_left(owner, w);
                        w = self.left(x_parent);
                    }
                    self.set_color(w, self.color(x_parent));
                    self.set_color(x_parent, COLOR_BLACK);
                    self.set_color(self.left(w), COLOR_BLACK);
                    self.rotate_right(owner, x_parent);
                    x = self.tree_root(owner);
                    x_parent = NIL;
                }
            }
        }
        self.set_color(x, COLOR_BLACK);
    }
}

#[cfg(test)]
mod tests {
    use super::super::{DirEntry, ROOT_SID};
    use super::*;
    use proptest::prelude::*;

    /// Validate ordering, colouring and black height; returns the black height
    fn check_subtree(dir: &Directory, sid: u32, parent: u32) -> usize {
        if sid == NIL {
            return 1;
        }
        let node = dir.get(sid).unwrap();
        assert_eq!(node.parent, parent, "parent link of {sid}");
        if node.color == COLOR_RED {
            assert!(!dir.is_red(node.left) && !dir.is_red(node.right), "red-red at {sid}");
        }
        if node.left != NIL {
            let left = &dir.get(node.left).unwrap().name;
            assert_eq!(compare_names(left, &node.name), Ordering::Less);
        }
        if node.right != NIL {
            let right = &dir.get(node.right).unwrap().name;
            assert_eq!(compare_names(right, &node.name), Ordering::Greater);
        }
        let lh = check_subtree(dir, node.left, sid);
        let rh = check_subtree(dir, node.right, sid);
        assert_eq!(lh, rh, "black height mismatch at {sid}");
        lh + usize::from(node.color == COLOR_BLACK)
    }

    fn check_tree(dir: &Directory, owner: u32) {
        let root = dir.tree_root(owner);
        assert!(!dir.is_red(root));
        check_subtree(dir, root, NIL);
    }

    fn add(dir: &mut Directory, owner: u32, name: &str) -> u32 {
        let sid = dir.allocate(DirEntry::stream(name));
        dir.insert(owner, sid).unwrap();
        sid
    }

    #[test]
    fn test_insert_keeps_order() {
        let mut dir = Directory::new();
        for name in ["delta", "Alpha", "b", "CHARLIE", "echo", "a1"] {
            add(&mut dir, ROOT_SID, name);
        }
        check_tree(&dir, ROOT_SID);
        let names: Vec<_> = dir
            .children(ROOT_SID)
            .unwrap()
            .into_iter()
            .map(|sid| dir.get(sid).unwrap().name.clone())
            .collect();
        assert_eq!(names, ["b", "a1", "echo", "Alpha", "delta", "CHARLIE"]);
    }

    #[test]
    fn test_collision_leaves_tree_untouched() {
        let mut dir = Directory::new();
        add(&mut dir, ROOT_SID, "Data");
        let dup = dir.allocate(DirEntry::stream("DATA"));
        let before = dir.clone();
        let err = dir.insert(ROOT_SID, dup).unwrap_err();
        assert!(matches!(err, Error::NameCollision(_)));
        assert_eq!(dir.children(ROOT_SID).unwrap(), before.children(ROOT_SID).unwrap());
    }

    #[test]
    fn test_prefix_and_case_lookup() {
        let mut dir = Directory::new();
        let short = add(&mut dir, ROOT_SID, "Stream");
        let long = add(&mut dir, ROOT_SID, "stream1");
        assert_eq!(dir.find(ROOT_SID, "STREAM").unwrap(), Some(short));
        assert_eq!(dir.find(ROOT_SID, "Stream1").unwrap(), Some(long));
        assert_eq!(dir.find(ROOT_SID, "Stream2").unwrap(), None);
    }

    #[test]
    fn test_remove_root_updates_owner() {
        let mut dir = Directory::new();
        let sids: Vec<_> = ["a", "b", "c"].iter().map(|n| add(&mut dir, ROOT_SID, n)).collect();
        let root = dir.tree_root(ROOT_SID);
        assert_eq!(root, sids[1]);
        dir.remove(ROOT_SID, root).unwrap();
        check_tree(&dir, ROOT_SID);
        assert_ne!(dir.tree_root(ROOT_SID), root);
        assert_eq!(dir.children(ROOT_SID).unwrap().len(), 2);
    }

    #[test]
    fn test_cyclic_siblings_detected() {
        let mut dir = Directory::new();
        let a = add(&mut dir, ROOT_SID, "a");
        let b = add(&mut dir, ROOT_SID, "bb");
        dir.get_mut(b).unwrap().right = a;
        assert!(dir.children(ROOT_SID).unwrap_err().is_corrupted());
        assert!(dir.find(ROOT_SID, "zzzz").unwrap_err().is_corrupted());
    }

    proptest! {
        #[test]
        fn prop_red_black_invariants(
            names in proptest::collection::btree_set("[a-z]{1,6}", 1..60),
            removals in proptest::collection::vec(any::<prop::sample::Index>(), 0..40),
        ) {
            let mut dir = Directory::new();
            let mut live: Vec<(String, u32)> = names
                .iter()
                .map(|name| (name.clone(), add(&mut dir, ROOT_SID, name)))
                .collect();
            check_tree(&dir, ROOT_SID);

            for index in removals {
                if live.is_empty() {
                    break;
                }
                let (name, sid) = live.remove(index.index(live.len()));
                dir.remove(ROOT_SID, sid).unwrap();
                dir.release(sid);
                check_tree(&dir, ROOT_SID);
                prop_assert_eq!(dir.find(ROOT_SID, &name).unwrap(), None);
            }

            for (name, sid) in &live {
                prop_assert_eq!(dir.find(ROOT_SID, name).unwrap(), Some(*sid));
            }
            prop_assert_eq!(dir.children(ROOT_SID).unwrap().len(), live.len());
        }
    }
}
