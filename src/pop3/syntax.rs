//-
// Copyright (c) 2025, Jason Lingle
//
// This file is part of Graphgate.
//
// Graphgate is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Graphgate is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY;  without even the  implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Graphgate. If not, see <http://www.gnu.org/licenses/>.

use std::str::FromStr;

/// RFC 1939 commands plus RFC 2449 CAPA, RFC 2595 STLS, and RFC 5034
/// AUTH. Message numbers are 1-based as on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    User(String),
    Pass(String),
    /// AUTH [mechanism [initial-response]]
    Auth(Option<String>, Option<String>),
    Capa,
    Stls,
    Stat,
    List(Option<usize>),
    Uidl(Option<usize>),
    Retr(usize),
    Top(usize, usize),
    Dele(usize),
    Rset,
    Noop,
    Quit,
}

impl FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let (keyword, args) = match s.split_once(' ') {
            Some((keyword, args)) => (keyword, args),
            None => (s, ""),
        };

        fn msg(args: &str) -> Result<usize, ()> {
            args.trim().parse::<usize>().ok().filter(|&n| n > 0).ok_or(())
        }

        fn opt_msg(args: &str) -> Result<Option<usize>, ()> {
            if args.trim().is_empty() {
                Ok(None)
            } else {
                msg(args).map(Some)
            }
        }

        if keyword.eq_ignore_ascii_case("USER") {
            if args.is_empty() {
                return Err(());
            }
            Ok(Command::User(args.to_owned()))
        } else if keyword.eq_ignore_ascii_case("PASS") {
            // The argument is everything after the space, verbatim;
            // passwords may contain spaces.
            if args.is_empty() {
                return Err(());
            }
            Ok(Command::Pass(args.to_owned()))
        } else if keyword.eq_ignore_ascii_case("AUTH") {
            let mut parts = args.split_ascii_whitespace();
            let mechanism = parts.next().map(str::to_owned);
            let initial = parts.next().map(str::to_owned);
            if parts.next().is_some() {
                return Err(());
            }
            Ok(Command::Auth(mechanism, initial))
        } else if keyword.eq_ignore_ascii_case("CAPA") {
            Ok(Command::Capa)
        } else if keyword.eq_ignore_ascii_case("STLS") {
            Ok(Command::Stls)
        } else if keyword.eq_ignore_ascii_case("STAT") {
            Ok(Command::Stat)
        } else if keyword.eq_ignore_ascii_case("LIST") {
            opt_msg(args).map(Command::List)
        } else if keyword.eq_ignore_ascii_case("UIDL") {
            opt_msg(args).map(Command::Uidl)
        } else if keyword.eq_ignore_ascii_case("RETR") {
            msg(args).map(Command::Retr)
        } else if keyword.eq_ignore_ascii_case("TOP") {
            let mut parts = args.split_ascii_whitespace();
            let (Some(number), Some(lines), None) =
                (parts.next(), parts.next(), parts.next())
            else {
                return Err(());
            };
            let number = msg(number)?;
            let lines = lines.parse::<usize>().map_err(|_| ())?;
            Ok(Command::Top(number, lines))
        } else if keyword.eq_ignore_ascii_case("DELE") {
            msg(args).map(Command::Dele)
        } else if keyword.eq_ignore_ascii_case("RSET") {
            Ok(Command::Rset)
        } else if keyword.eq_ignore_ascii_case("NOOP") {
            Ok(Command::Noop)
        } else if keyword.eq_ignore_ascii_case("QUIT") {
            Ok(Command::Quit)
        } else {
            Err(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_parsing() {
        assert_eq!(
            Ok(Command::User("alerts@t.com".to_owned())),
            "USER alerts@t.com".parse()
        );
        assert_eq!(
            Ok(Command::Pass("pass with spaces".to_owned())),
            "pass pass with spaces".parse()
        );
        assert_eq!(Err(()), "USER".parse::<Command>());
        assert_eq!(Err(()), "PASS".parse::<Command>());

        assert_eq!(Ok(Command::Auth(None, None)), "AUTH".parse());
        assert_eq!(
            Ok(Command::Auth(Some("PLAIN".to_owned()), None)),
            "auth PLAIN".parse()
        );
        assert_eq!(
            Ok(Command::Auth(
                Some("PLAIN".to_owned()),
                Some("AGZvbwBiYXI=".to_owned()),
            )),
            "AUTH PLAIN AGZvbwBiYXI=".parse()
        );

        assert_eq!(Ok(Command::Capa), "CAPA".parse());
        assert_eq!(Ok(Command::Stls), "stls".parse());
        assert_eq!(Ok(Command::Stat), "STAT".parse());

        assert_eq!(Ok(Command::List(None)), "LIST".parse());
        assert_eq!(Ok(Command::List(Some(3))), "LIST 3".parse());
        assert_eq!(Err(()), "LIST 0".parse::<Command>());
        assert_eq!(Err(()), "LIST x".parse::<Command>());

        assert_eq!(Ok(Command::Uidl(None)), "UIDL".parse());
        assert_eq!(Ok(Command::Uidl(Some(1))), "UIDL 1".parse());

        assert_eq!(Ok(Command::Retr(2)), "RETR 2".parse());
        assert_eq!(Err(()), "RETR".parse::<Command>());

        assert_eq!(Ok(Command::Top(2, 0)), "TOP 2 0".parse());
        assert_eq!(Ok(Command::Top(1, 10)), "top 1 10".parse());
        assert_eq!(Err(()), "TOP 1".parse::<Command>());

        assert_eq!(Ok(Command::Dele(4)), "DELE 4".parse());
        assert_eq!(Ok(Command::Rset), "RSET".parse());
        assert_eq!(Ok(Command::Noop), "NOOP".parse());
        assert_eq!(Ok(Command::Quit), "QUIT".parse());

        assert_eq!(Err(()), "XTND".parse::<Command>());
    }
}
