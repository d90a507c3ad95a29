use super::replacer::{FrameId, Replacer};

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<FrameId>,
    next: Option<FrameId>,
    linked: bool,
}

/// Hands out the frame whose last pin was released longest ago.
///
/// An intrusive doubly linked list indexed by frame id keeps every
/// operation O(1).
#[derive(Debug)]
pub struct LruReplacer {
    links: Vec<Link>,
    /// Least recently used end.
    head: Option<FrameId>,
    /// Most recently used end.
    tail: Option<FrameId>,
    len: usize,
}

impl LruReplacer {
    pub fn new(num_frames: usize) -> Self {
        Self {
            links: vec![Link::default(); num_frames],
            head: None,
            tail: None,
            len: 0,
        }
    }

    fn link(&self, frame_id: FrameId) -> Option<&Link> {
        self.links.get(frame_id as usize)
    }

    fn unlink(&mut self, frame_id: FrameId) {
        let link = self.links[frame_id as usize];
        match link.prev {
            Some(prev) => self.links[prev as usize].next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => self.links[next as usize].prev = link.prev,
            None => self.tail = link.prev,
        }
        self.links[frame_id as usize] = Link::default();
        self.len -= 1;
    }
}

impl Replacer for LruReplacer {
    fn take_victim(&mut self) -> Option<FrameId> {
        let victim = self.head?;
        self.unlink(victim);
        Some(victim)
    }

    fn hold(&mut self, frame_id: FrameId) {
        if self.link(frame_id).is_some_and(|l| l.linked) {
            self.unlink(frame_id);
        }
    }

    fn release(&mut self, frame_id: FrameId) {
        match self.link(frame_id) {
            Some(link) if !link.linked => {}
            _ => return,
        }
        self.links[frame_id as usize] = Link {
            prev: self.tail,
            next: None,
            linked: true,
        };
        match self.tail {
            Some(tail) => self.links[tail as usize].next = Some(frame_id),
            None => self.head = Some(frame_id),
        }
        self.tail = Some(frame_id);
        self.len += 1;
    }

    fn evictable(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victims_follow_release_order() {
        let mut replacer = LruReplacer::new(4);
        assert_eq!(replacer.evictable(), 0);
        assert_eq!(replacer.take_victim(), None);

        replacer.release(1);
        replacer.release(2);
        replacer.release(3);
        assert_eq!(replacer.evictable(), 3);

        assert_eq!(replacer.take_victim(), Some(1));
        assert_eq!(replacer.take_victim(), Some(2));
        assert_eq!(replacer.take_victim(), Some(3));
        assert_eq!(replacer.take_victim(), None);
        assert_eq!(replacer.evictable(), 0);
    }

    #[test]
    fn test_held_frame_is_never_a_victim() {
        let mut replacer = LruReplacer::new(3);

        replacer.release(1);
        replacer.release(2);
        replacer.hold(1);
        assert_eq!(replacer.evictable(), 1);

        assert_eq!(replacer.take_victim(), Some(2));
        assert_eq!(replacer.take_victim(), None);

        replacer.release(1);
        assert_eq!(replacer.take_victim(), Some(1));
    }

    #[test]
    fn test_repeat_release_keeps_position() {
        let mut replacer = LruReplacer::new(3);

        replacer.release(0);
        replacer.release(1);
        replacer.release(0);
        assert_eq!(replacer.evictable(), 2);
        assert_eq!(replacer.take_victim(), Some(0));
        assert_eq!(replacer.take_victim(), Some(1));
    }

    #[test]
    fn test_frames_outside_the_arena_are_ignored() {
        let mut replacer = LruReplacer::new(2);

        replacer.release(1);
        replacer.hold(999);
        replacer.release(999);
        assert_eq!(replacer.evictable(), 1);
        assert_eq!(replacer.take_victim(), Some(1));
        assert_eq!(replacer.take_victim(), None);
    }

    #[test]
    fn test_skipped_victim_returns_at_the_back() {
        let mut replacer = LruReplacer::new(5);

        replacer.release(0);
        replacer.release(1);
        replacer.release(2);

        // Frame 0 is handed out but its claim fails, so it is given back.
        assert_eq!(replacer.take_victim(), Some(0));
        replacer.hold(1);
        assert_eq!(replacer.evictable(), 1);
        replacer.release(1);
        replacer.release(4);
        replacer.release(0);

        assert_eq!(replacer.take_victim(), Some(2));
        assert_eq!(replacer.take_victim(), Some(1));
        assert_eq!(replacer.take_victim(), Some(4));
        assert_eq!(replacer.take_victim(), Some(0));
        assert_eq!(replacer.evictable(), 0);
    }
}
