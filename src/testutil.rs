use crate::link::{LinkError, SambaLink};
use std::cell::RefCell;
use std::rc::Rc;

/// One call made against a [FakeLink], in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    WriteBuffer(u32, Vec<u8>),
    WriteWord(u32, u32),
    ReadWord(u32),
    Jump(u32),
    Close,
}

/// A scripted link that records every call. The log is shared so it stays
/// readable after the link has been consumed by the code under test. Calls
/// are recorded even when scripted to fail, so tests can assert that an
/// attempt happened.
pub struct FakeLink {
    log: Rc<RefCell<Vec<Op>>>,
    pub fail_write_buffer: bool,
    pub fail_jump: bool,
    pub read_word_result: u32,
}

impl FakeLink {
    pub fn new() -> (Self, Rc<RefCell<Vec<Op>>>) {
        let log = Rc::new(RefCell::new(vec![]));
        let link = FakeLink {
            log: log.clone(),
            fail_write_buffer: false,
            fail_jump: false,
            read_word_result: 0,
        };
        (link, log)
    }

    fn scripted_failure(action: &'static str) -> LinkError {
        LinkError::ShortTransfer {
            action,
            expected: 1,
            actual: 0,
        }
    }
}

impl SambaLink for FakeLink {
    fn write_buffer(&mut self, addr: u32, data: &[u8]) -> Result<(), LinkError> {
        self.log
            .borrow_mut()
            .push(Op::WriteBuffer(addr, data.to_vec()));
        if self.fail_write_buffer {
            return Err(Self::scripted_failure("writing buffer"));
        }
        Ok(())
    }

    fn write_word(&mut self, addr: u32, word: u32) -> Result<(), LinkError> {
        self.log.borrow_mut().push(Op::WriteWord(addr, word));
        Ok(())
    }

    fn read_word(&mut self, addr: u32) -> Result<u32, LinkError> {
        self.log.borrow_mut().push(Op::ReadWord(addr));
        Ok(self.read_word_result)
    }

    fn jump(&mut self, addr: u32) -> Result<(), LinkError> {
        self.log.borrow_mut().push(Op::Jump(addr));
        if self.fail_jump {
            return Err(Self::scripted_failure("jumping"));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), LinkError> {
        self.log.borrow_mut().push(Op::Close);
        Ok(())
    }
}
